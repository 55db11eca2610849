//! Legacy 8259 PICs and the 32-bit interrupt descriptor table.
//!
//! IRQ handlers only touch lock-free state: the timer's atomics and the input ring.

use super::PortIo;

pub const PIC1_COMMAND: u16 = 0x20;
pub const PIC1_DATA: u16 = 0x21;
pub const PIC2_COMMAND: u16 = 0xA0;
pub const PIC2_DATA: u16 = 0xA1;

/// Vectors the remapped PICs deliver IRQ 0..16 on.
pub const PIC1_OFFSET: u8 = 0x20;
pub const PIC2_OFFSET: u8 = 0x28;

pub const IRQ_TIMER: u8 = 0;
pub const IRQ_KEYBOARD: u8 = 1;
const IRQ_CASCADE: u8 = 2;

const ICW1_INIT: u8 = 0x11;
const ICW4_8086: u8 = 0x01;
const EOI: u8 = 0x20;

/// Moves the PIC vectors clear of the CPU exceptions and masks every IRQ except
/// those in `enabled`.
pub fn remap_pics(ports: &mut impl PortIo, enabled: &[u8]) {
    let mask = enabled.iter().fold(0xFFFFu16, |mask, &irq| mask & !(1 << irq));
    // The slave PIC only gets through if the cascade line is open.
    let mask = if mask & 0xFF00 != 0xFF00 { mask & !(1 << IRQ_CASCADE) } else { mask };
    unsafe {
        ports.write_u8(PIC1_COMMAND, ICW1_INIT);
        ports.write_u8(PIC2_COMMAND, ICW1_INIT);
        ports.write_u8(PIC1_DATA, PIC1_OFFSET);
        ports.write_u8(PIC2_DATA, PIC2_OFFSET);
        ports.write_u8(PIC1_DATA, 1 << IRQ_CASCADE);
        ports.write_u8(PIC2_DATA, IRQ_CASCADE);
        ports.write_u8(PIC1_DATA, ICW4_8086);
        ports.write_u8(PIC2_DATA, ICW4_8086);
        ports.write_u8(PIC1_DATA, mask as u8);
        ports.write_u8(PIC2_DATA, (mask >> 8) as u8);
    }
}

pub fn end_of_interrupt(ports: &mut impl PortIo, irq: u8) {
    unsafe {
        if irq >= 8 {
            ports.write_u8(PIC2_COMMAND, EOI);
        }
        ports.write_u8(PIC1_COMMAND, EOI);
    }
}

/// 32-bit interrupt gate, present, ring 0.
const INTERRUPT_GATE: u8 = 0x8E;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C, packed)]
pub struct Gate {
    offset_low: u16,
    selector: u16,
    zero: u8,
    attributes: u8,
    offset_high: u16,
}

impl Gate {
    pub const MISSING: Gate = Gate { offset_low: 0, selector: 0, zero: 0, attributes: 0, offset_high: 0 };

    pub fn new(handler: u32, selector: u16) -> Self {
        Self {
            offset_low: handler as u16,
            selector,
            zero: 0,
            attributes: INTERRUPT_GATE,
            offset_high: (handler >> 16) as u16,
        }
    }

    pub fn handler(&self) -> u32 {
        u32::from(self.offset_high) << 16 | u32::from(self.offset_low)
    }
}

const EXCEPTION_NAMES: [&str; 20] = [
    "divide error",
    "debug",
    "non-maskable interrupt",
    "breakpoint",
    "overflow",
    "bound range exceeded",
    "invalid opcode",
    "device not available",
    "double fault",
    "coprocessor segment overrun",
    "invalid TSS",
    "segment not present",
    "stack-segment fault",
    "general protection fault",
    "page fault",
    "reserved",
    "x87 floating-point exception",
    "alignment check",
    "machine check",
    "SIMD floating-point exception",
];

pub fn exception_name(vector: u32) -> &'static str {
    EXCEPTION_NAMES.get(vector as usize).copied().unwrap_or("reserved")
}

#[cfg(all(target_os = "none", target_arch = "x86"))]
pub use bare::install;

#[cfg(all(target_os = "none", target_arch = "x86"))]
mod bare {
    use super::*;
    use crate::arch::X86Ports;
    use crate::drivers::keyboard::{self, Keyboard};
    use crate::input::InputQueue;
    use crate::time::Timer;
    use alloc::sync::Arc;

    struct IrqTargets {
        timer: Arc<Timer>,
        input: Arc<InputQueue>,
        keyboard: spin::Mutex<Keyboard>,
    }

    static TARGETS: spin::Once<IrqTargets> = spin::Once::new();
    static IDT: spin::Once<[Gate; 256]> = spin::Once::new();

    extern "C" fn timer_irq() {
        if let Some(targets) = TARGETS.get() {
            targets.timer.on_tick();
        }
        end_of_interrupt(&mut X86Ports, IRQ_TIMER);
    }

    extern "C" fn keyboard_irq() {
        let scancode = unsafe { X86Ports.read_u8(keyboard::DATA_PORT) };
        if let Some(targets) = TARGETS.get()
            && let Some(event) = targets.keyboard.lock().decode(scancode)
        {
            // A full ring drops the key.
            targets.input.push(event);
        }
        end_of_interrupt(&mut X86Ports, IRQ_KEYBOARD);
    }

    extern "C" fn cpu_exception(vector: u32) -> ! {
        panic!("interrupts: cpu exception {vector} ({})", exception_name(vector));
    }

    #[unsafe(naked)]
    unsafe extern "C" fn timer_stub() {
        core::arch::naked_asm!("pushad", "cld", "call {handler}", "popad", "iretd", handler = sym timer_irq);
    }

    #[unsafe(naked)]
    unsafe extern "C" fn keyboard_stub() {
        core::arch::naked_asm!("pushad", "cld", "call {handler}", "popad", "iretd", handler = sym keyboard_irq);
    }

    macro_rules! exception_stubs {
        ($($name:ident = $vector:literal),* $(,)?) => {
            $(
                #[unsafe(naked)]
                unsafe extern "C" fn $name() {
                    core::arch::naked_asm!(
                        "cld",
                        "push {vector}",
                        "call {handler}",
                        "ud2",
                        vector = const $vector,
                        handler = sym cpu_exception,
                    );
                }
            )*
            const EXCEPTION_STUBS: &[(u8, unsafe extern "C" fn())] = &[$(($vector, $name as unsafe extern "C" fn())),*];
        };
    }

    exception_stubs!(
        divide_error = 0,
        invalid_opcode = 6,
        double_fault = 8,
        stack_segment_fault = 12,
        general_protection = 13,
        page_fault = 14,
    );

    /// Loads the IDT, remaps the PICs and opens the timer and keyboard lines.
    /// Interrupts stay disabled until the caller enables them.
    pub fn install(timer: Arc<Timer>, input: Arc<InputQueue>) {
        TARGETS.call_once(|| IrqTargets { timer, input, keyboard: spin::Mutex::new(Keyboard::new()) });
        let selector = x86::segmentation::cs().bits();
        let idt = IDT.call_once(|| {
            let mut idt = [Gate::MISSING; 256];
            for &(vector, stub) in EXCEPTION_STUBS {
                idt[usize::from(vector)] = Gate::new(stub as usize as u32, selector);
            }
            idt[usize::from(PIC1_OFFSET + IRQ_TIMER)] = Gate::new(timer_stub as usize as u32, selector);
            idt[usize::from(PIC1_OFFSET + IRQ_KEYBOARD)] = Gate::new(keyboard_stub as usize as u32, selector);
            idt
        });
        unsafe { x86::dtables::lidt(&x86::dtables::DescriptorTablePointer::new_from_slice(&idt[..])) };
        remap_pics(&mut X86Ports, &[IRQ_TIMER, IRQ_KEYBOARD]);
        log::info!("interrupts: IDT loaded, timer and keyboard IRQs unmasked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    #[derive(Default)]
    struct Recorder {
        writes: Vec<(u16, u8)>,
    }

    impl PortIo for Recorder {
        unsafe fn read_u8(&mut self, _port: u16) -> u8 {
            0
        }
        unsafe fn write_u8(&mut self, port: u16, value: u8) {
            self.writes.push((port, value));
        }
        unsafe fn read_u16(&mut self, _port: u16) -> u16 {
            0
        }
        unsafe fn write_u16(&mut self, _port: u16, _value: u16) {}
    }

    #[test]
    fn remap_sets_offsets_and_masks() {
        let mut ports = Recorder::default();
        remap_pics(&mut ports, &[IRQ_TIMER, IRQ_KEYBOARD]);
        assert_eq!(ports.writes[2], (PIC1_DATA, PIC1_OFFSET));
        assert_eq!(ports.writes[3], (PIC2_DATA, PIC2_OFFSET));
        assert_eq!(ports.writes[8], (PIC1_DATA, 0b1111_1100));
        assert_eq!(ports.writes[9], (PIC2_DATA, 0xFF));
    }

    #[test]
    fn slave_irq_opens_cascade() {
        let mut ports = Recorder::default();
        remap_pics(&mut ports, &[14]);
        assert_eq!(ports.writes[8], (PIC1_DATA, 0b1111_1011));
        assert_eq!(ports.writes[9], (PIC2_DATA, 0b1011_1111));
    }

    #[test]
    fn eoi_goes_to_both_pics_for_slave_irqs() {
        let mut ports = Recorder::default();
        end_of_interrupt(&mut ports, IRQ_TIMER);
        end_of_interrupt(&mut ports, 12);
        assert_eq!(ports.writes, [(PIC1_COMMAND, EOI), (PIC2_COMMAND, EOI), (PIC1_COMMAND, EOI)]);
    }

    #[test]
    fn gate_encoding() {
        let gate = Gate::new(0x0010_2345, 0x08);
        assert_eq!(gate.handler(), 0x0010_2345);
        assert_eq!(size_of::<Gate>(), 8);
        assert_eq!(exception_name(14), "page fault");
        assert_eq!(exception_name(31), "reserved");
    }
}
