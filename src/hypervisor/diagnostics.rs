//! Dumps used on fatal paths.

use core::fmt::Write;

use super::{host::VirtualCpu, intel::vmcs::Vmcs, registers::Registers};

/// Returns the general purpose registers and the VMCS of `vcpu` as a
/// multi-line report.
pub fn dump_state<V: VirtualCpu>(vcpu: &V) -> String {
    let registers = match Registers::capture(vcpu) {
        Ok(registers) => format!("{registers:#x?}"),
        Err(err) => format!("Registers unavailable: {err}"),
    };
    format!("{registers}\n{:#x?}", Vmcs(vcpu))
}

/// Formats `bytes` as hex and printable ASCII, 16 bytes per line. Each line
/// starts with the offset of its first byte from `offset_base` in decimal.
pub fn hexdump(offset_base: usize, bytes: &[u8]) -> String {
    let mut output = String::new();
    for (index, line) in bytes.chunks(16).enumerate() {
        let mut hex = String::new();
        for (position, byte) in line.iter().enumerate() {
            let separator = match position {
                0 => "",
                8 => "  ",
                _ => " ",
            };
            let _ = write!(hex, "{separator}{byte:02x}");
        }
        let ascii: String = line
            .iter()
            .map(|&byte| {
                if byte.is_ascii_graphic() || byte == b' ' {
                    char::from(byte)
                } else {
                    '.'
                }
            })
            .collect();
        let _ = writeln!(
            output,
            "{:05}   {hex:<48}   {ascii}",
            offset_base + index * 16
        );
    }
    output
}
