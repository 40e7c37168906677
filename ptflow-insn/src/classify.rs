//! Instruction classification on top of the `iced-x86` decoder.
//!
//! The flow decoder only needs a coarse view of every instruction: how
//! long it is, which control-flow class it belongs to, and the target
//! when the branch is direct.

use derive_more::Display;
use iced_x86::{Code, DecoderOptions, FlowControl};
use ptflow_codec::ExecMode;

/// Coarse control-flow class of an instruction.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum InsnClass {
    /// No control-flow relevance
    Other,
    NearCall,
    NearReturn,
    NearJump,
    NearCondJump,
    FarCall,
    FarReturn,
    FarJump,
    /// The bytes do not decode to an instruction
    Error,
}

/// Classification of one decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Classified {
    pub(crate) class: InsnClass,
    pub(crate) len: u8,
    /// The statically known branch target; `None` for indirect and far
    /// transfers, whose destination comes from the trace.
    pub(crate) target: Option<u64>,
}

/// Decode and classify the instruction in `bytes` at `ip`.
///
/// Bytes that do not decode get [`InsnClass::Error`]; the flow decoder
/// reports them as `bad_insn` when it tries to step over them.
pub(crate) fn classify(bytes: &[u8], ip: u64, mode: ExecMode) -> Classified {
    let mut decoder = iced_x86::Decoder::with_ip(mode.bitness(), bytes, ip, DecoderOptions::NONE);
    let instruction = decoder.decode();
    if instruction.is_invalid() {
        return Classified {
            class: InsnClass::Error,
            len: instruction.len() as u8,
            target: None,
        };
    }

    let (class, target) = match instruction.flow_control() {
        FlowControl::Next | FlowControl::XbeginXabortXend => (InsnClass::Other, None),
        FlowControl::ConditionalBranch => (
            InsnClass::NearCondJump,
            Some(instruction.near_branch_target()),
        ),
        FlowControl::UnconditionalBranch => {
            if instruction.is_jmp_far() {
                (InsnClass::FarJump, None)
            } else {
                (InsnClass::NearJump, Some(instruction.near_branch_target()))
            }
        }
        FlowControl::IndirectBranch => {
            if instruction.is_jmp_far_indirect() {
                (InsnClass::FarJump, None)
            } else {
                (InsnClass::NearJump, None)
            }
        }
        FlowControl::Call => {
            if instruction.is_call_near() {
                (InsnClass::NearCall, Some(instruction.near_branch_target()))
            } else {
                (InsnClass::FarCall, None)
            }
        }
        FlowControl::IndirectCall => {
            if instruction.is_call_far_indirect() {
                (InsnClass::FarCall, None)
            } else {
                (InsnClass::NearCall, None)
            }
        }
        FlowControl::Return => match instruction.code() {
            Code::Retnw
            | Code::Retnd
            | Code::Retnq
            | Code::Retnw_imm16
            | Code::Retnd_imm16
            | Code::Retnq_imm16 => (InsnClass::NearReturn, None),
            _ => (InsnClass::FarReturn, None),
        },
        FlowControl::Interrupt | FlowControl::Exception => (InsnClass::FarCall, None),
    };

    Classified {
        class,
        len: instruction.len() as u8,
        target,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify64(bytes: &[u8], ip: u64) -> Classified {
        classify(bytes, ip, ExecMode::Mode64)
    }

    #[test]
    fn straight_line_code() {
        let nop = classify64(&[0x90], 0x1000);
        assert_eq!(nop.class, InsnClass::Other);
        assert_eq!(nop.len, 1);
        assert_eq!(nop.target, None);
    }

    #[test]
    fn direct_branches_carry_their_target() {
        // jne +5
        let jne = classify64(&[0x75, 0x05], 0x1000);
        assert_eq!(jne.class, InsnClass::NearCondJump);
        assert_eq!(jne.target, Some(0x1007));

        // jmp short +2
        let jmp = classify64(&[0xeb, 0x02], 0x1000);
        assert_eq!(jmp.class, InsnClass::NearJump);
        assert_eq!(jmp.target, Some(0x1004));

        // call rel32 +0x10
        let call = classify64(&[0xe8, 0x10, 0x00, 0x00, 0x00], 0x1000);
        assert_eq!(call.class, InsnClass::NearCall);
        assert_eq!(call.target, Some(0x1015));
    }

    #[test]
    fn indirect_branches_have_no_target() {
        // jmp rax
        let jmp = classify64(&[0xff, 0xe0], 0x1000);
        assert_eq!(jmp.class, InsnClass::NearJump);
        assert_eq!(jmp.target, None);

        // call rax
        let call = classify64(&[0xff, 0xd0], 0x1000);
        assert_eq!(call.class, InsnClass::NearCall);
        assert_eq!(call.target, None);
    }

    #[test]
    fn returns_and_far_transfers() {
        assert_eq!(classify64(&[0xc3], 0x1000).class, InsnClass::NearReturn);
        assert_eq!(
            classify64(&[0xc2, 0x08, 0x00], 0x1000).class,
            InsnClass::NearReturn
        );
        assert_eq!(classify64(&[0xcb], 0x1000).class, InsnClass::FarReturn);
        // int 0x80
        assert_eq!(classify64(&[0xcd, 0x80], 0x1000).class, InsnClass::FarCall);
        // syscall
        assert_eq!(classify64(&[0x0f, 0x05], 0x1000).class, InsnClass::FarCall);
    }

    #[test]
    fn undecodable_bytes_classify_as_error() {
        // A lone prefix is not an instruction.
        assert_eq!(classify64(&[0x66], 0x1000).class, InsnClass::Error);
        assert_eq!(classify64(&[], 0x1000).class, InsnClass::Error);
    }

    #[test]
    fn mode_changes_the_decode() {
        // inc eax in 32-bit mode; REX prefix in 64-bit mode.
        let inc = classify(&[0x40, 0x90], 0x1000, ExecMode::Mode32);
        assert_eq!(inc.len, 1);
        let rex_nop = classify(&[0x40, 0x90], 0x1000, ExecMode::Mode64);
        assert_eq!(rex_nop.len, 2);
    }
}
