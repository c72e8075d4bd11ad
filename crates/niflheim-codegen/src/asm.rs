//! Intel-syntax assembly text writer.
//!
//! A thin buffer with helpers for the handful of shapes the emitter needs:
//! instructions, labels, section directives, and `rbp`-relative operands.
//! No instruction database: the emitter writes mnemonics directly and this
//! module keeps the formatting uniform.

use std::fmt::Write;

/// General-purpose 64-bit registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Reg {
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rsi,
    Rdi,
    Rbp,
    Rsp,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

impl Reg {
    /// Intel-syntax name.
    pub const fn name(self) -> &'static str {
        match self {
            Reg::Rax => "rax",
            Reg::Rbx => "rbx",
            Reg::Rcx => "rcx",
            Reg::Rdx => "rdx",
            Reg::Rsi => "rsi",
            Reg::Rdi => "rdi",
            Reg::Rbp => "rbp",
            Reg::Rsp => "rsp",
            Reg::R8 => "r8",
            Reg::R9 => "r9",
            Reg::R10 => "r10",
            Reg::R11 => "r11",
            Reg::R12 => "r12",
            Reg::R13 => "r13",
            Reg::R14 => "r14",
            Reg::R15 => "r15",
        }
    }
}

impl std::fmt::Display for Reg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// `qword ptr [rbp-D]` for a frame displacement below `rbp`.
pub fn frame_qword(displacement: u64) -> String {
    format!("qword ptr [rbp-{displacement}]")
}

/// `[rbp-D]` without a size prefix, for `lea`.
pub fn frame_addr(displacement: u64) -> String {
    format!("[rbp-{displacement}]")
}

/// `qword ptr [BASE+OFF]` for an object field access.
pub fn field_qword(base: Reg, offset: u64) -> String {
    format!("qword ptr [{base}+{offset}]")
}

/// `byte ptr [BASE+OFF]` for a byte-wide field access.
pub fn field_byte(base: Reg, offset: u64) -> String {
    format!("byte ptr [{base}+{offset}]")
}

/// `qword ptr [rip+SYM]` for PC-relative data access.
pub fn rip_qword(symbol: &str) -> String {
    format!("qword ptr [rip+{symbol}]")
}

/// `[rip+SYM]` without a size prefix, for `lea`.
pub fn rip_addr(symbol: &str) -> String {
    format!("[rip+{symbol}]")
}

/// Growing assembly buffer.
pub struct AsmBuf {
    out: String,
    label_counter: usize,
    /// Emit `#`-comments when set.
    pub comments: bool,
}

impl AsmBuf {
    /// Empty buffer.
    pub fn new(comments: bool) -> Self {
        Self {
            out: String::new(),
            label_counter: 0,
            comments,
        }
    }

    /// One instruction line (tab-indented).
    pub fn ins(&mut self, text: impl AsRef<str>) {
        let _ = writeln!(self.out, "\t{}", text.as_ref());
    }

    /// One assembler directive line (tab-indented, caller includes the dot).
    pub fn directive(&mut self, text: impl AsRef<str>) {
        let _ = writeln!(self.out, "\t{}", text.as_ref());
    }

    /// A label definition at column zero.
    pub fn label(&mut self, name: &str) {
        let _ = writeln!(self.out, "{name}:");
    }

    /// A `#` comment line, when comments are enabled.
    pub fn comment(&mut self, text: impl AsRef<str>) {
        if self.comments {
            let _ = writeln!(self.out, "\t# {}", text.as_ref());
        }
    }

    /// Blank separator line.
    pub fn blank(&mut self) {
        self.out.push('\n');
    }

    /// A fresh local label, `.L<prefix><n>`.
    pub fn fresh_label(&mut self, prefix: &str) -> String {
        let label = format!(".L{}{}", prefix, self.label_counter);
        self.label_counter += 1;
        label
    }

    /// Finished text.
    pub fn finish(self) -> String {
        self.out
    }
}

/// Escape a byte string for an `.ascii` directive. Non-printable bytes use
/// octal escapes, which GNU as accepts in all modes.
pub fn escape_ascii(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() + 2);
    for &b in bytes {
        match b {
            b'"' => out.push_str("\\\""),
            b'\\' => out.push_str("\\\\"),
            0x20..=0x7e => out.push(b as char),
            _ => {
                let _ = write!(out, "\\{b:03o}");
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operand_formatting() {
        assert_eq!(frame_qword(40), "qword ptr [rbp-40]");
        assert_eq!(field_qword(Reg::Rax, 24), "qword ptr [rax+24]");
        assert_eq!(rip_addr("nfl_type_Point"), "[rip+nfl_type_Point]");
    }

    #[test]
    fn fresh_labels_are_unique() {
        let mut buf = AsmBuf::new(false);
        let a = buf.fresh_label("loop");
        let b = buf.fresh_label("loop");
        assert_ne!(a, b);
        assert!(a.starts_with(".Lloop"));
    }

    #[test]
    fn ascii_escaping() {
        assert_eq!(escape_ascii(b"hi"), "hi");
        assert_eq!(escape_ascii(b"a\"b"), "a\\\"b");
        assert_eq!(escape_ascii(b"\n"), "\\012");
    }

    #[test]
    fn comments_can_be_disabled() {
        let mut silent = AsmBuf::new(false);
        silent.comment("hidden");
        assert!(silent.finish().is_empty());

        let mut chatty = AsmBuf::new(true);
        chatty.comment("visible");
        assert!(chatty.finish().contains("# visible"));
    }
}
