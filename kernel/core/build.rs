use std::path::PathBuf;

fn main() {
    // Only the freestanding image needs the linker script; hosted builds and tests link normally.
    let os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    if os != "none" {
        return;
    }
    let arch = std::env::var("CARGO_CFG_TARGET_ARCH").unwrap();
    let dir = std::env::var("CARGO_MANIFEST_DIR").unwrap();
    let linker_file = PathBuf::from(dir).join(format!("linker-{arch}.ld"));
    let linker_file = linker_file.to_str().unwrap();

    println!("cargo:rustc-link-arg-bins=-T{linker_file}");
    println!("cargo:rerun-if-changed={linker_file}");
}
