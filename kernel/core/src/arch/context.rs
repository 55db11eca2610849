//! Cooperative stack switching.
//!
//! A suspended context is just a saved stack pointer: the callee-saved registers and
//! the flags are pushed onto the suspended stack before it is swapped out.

#[cfg(target_arch = "x86_64")]
macro_rules! save_context {
    () => {
        r#"
            push rbx
            push rbp
            push r12
            push r13
            push r14
            push r15
            pushfq
        "#
    };
}

#[cfg(target_arch = "x86_64")]
macro_rules! restore_context {
    () => {
        r#"
            popfq
            pop r15
            pop r14
            pop r13
            pop r12
            pop rbp
            pop rbx
        "#
    };
}

#[cfg(target_arch = "x86")]
macro_rules! save_context {
    () => {
        r#"
            push ebx
            push ebp
            push esi
            push edi
            pushfd
        "#
    };
}

#[cfg(target_arch = "x86")]
macro_rules! restore_context {
    () => {
        r#"
            popfd
            pop edi
            pop esi
            pop ebp
            pop ebx
        "#
    };
}

/// Interrupts enabled, reserved bit 1 set.
const INITIAL_FLAGS: usize = 0x202;

/// Saves the current context into `*prev_stack_pointer` and resumes the context whose
/// stack pointer is `next_stack_pointer`.
///
/// # Safety
/// `next_stack_pointer` must come from a previous `switch` or from [`prepare_stack`],
/// and the stack it points into must still be alive.
#[cfg(target_arch = "x86_64")]
#[unsafe(naked)]
pub unsafe extern "C" fn switch(prev_stack_pointer: *mut usize, next_stack_pointer: usize) {
    // Logs are not allowed here
    core::arch::naked_asm!(
        save_context!(),
        "mov [rdi], rsp",
        "mov rsp, rsi",
        restore_context!(),
        "ret",
    );
}

#[cfg(target_arch = "x86")]
#[unsafe(naked)]
pub unsafe extern "C" fn switch(prev_stack_pointer: *mut usize, next_stack_pointer: usize) {
    core::arch::naked_asm!(
        "mov eax, [esp + 4]",
        "mov edx, [esp + 8]",
        save_context!(),
        "mov [eax], esp",
        "mov esp, edx",
        restore_context!(),
        "ret",
    );
}

/// First code run on a fresh stack: calls `entry(arg)`, which must never return.
#[cfg(target_arch = "x86_64")]
#[unsafe(naked)]
unsafe extern "C" fn trampoline() {
    core::arch::naked_asm!("mov rdi, r13", "call r12", "ud2");
}

#[cfg(target_arch = "x86")]
#[unsafe(naked)]
unsafe extern "C" fn trampoline() {
    core::arch::naked_asm!("push esi", "call ebx", "ud2");
}

/// Lays out an initial frame at the top of `stack` so that the first `switch` into it
/// calls `entry(arg)` with an ABI-aligned stack. Returns the stack pointer to resume.
#[cfg(target_arch = "x86_64")]
pub fn prepare_stack(stack: &mut [u8], entry: extern "C" fn(usize) -> !, arg: usize) -> usize {
    let top = (stack.as_mut_ptr() as usize + stack.len()) & !0xF;
    // popfq, r15, r14, r13, r12, rbp, rbx, ret
    let frame = [INITIAL_FLAGS, 0, 0, arg, entry as usize, 0, 0, trampoline as usize];
    write_frame(stack, top, &frame)
}

#[cfg(target_arch = "x86")]
pub fn prepare_stack(stack: &mut [u8], entry: extern "C" fn(usize) -> !, arg: usize) -> usize {
    let top = (stack.as_mut_ptr() as usize + stack.len()) & !0xF;
    // popfd, edi, esi, ebp, ebx, ret, then padding so the call in the trampoline
    // happens on a 16-byte boundary.
    let frame = [INITIAL_FLAGS, 0, arg, 0, entry as usize, trampoline as usize, 0, 0, 0];
    write_frame(stack, top, &frame)
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
fn write_frame(stack: &mut [u8], top: usize, frame: &[usize]) -> usize {
    let base = stack.as_mut_ptr() as usize;
    let sp = top - core::mem::size_of_val(frame);
    assert!(sp >= base, "context: stack too small for the initial frame");
    let offset = sp - base;
    for (i, word) in frame.iter().enumerate() {
        let at = offset + i * size_of::<usize>();
        stack[at..at + size_of::<usize>()].copy_from_slice(&word.to_ne_bytes());
    }
    sp
}

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
pub unsafe extern "C" fn switch(_prev_stack_pointer: *mut usize, _next_stack_pointer: usize) {
    unimplemented!("context switching is only implemented for x86")
}

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
pub fn prepare_stack(_stack: &mut [u8], _entry: extern "C" fn(usize) -> !, _arg: usize) -> usize {
    unimplemented!("context switching is only implemented for x86")
}
