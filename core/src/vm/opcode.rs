use serde::{Deserialize, Serialize};

/// Instruction opcodes. The plain forms come from the compiler; adaptive and
/// specialized forms exist only inside quickened instruction streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Opcode {
    Nop = 0,
    PopTop,
    LoadConst,
    LoadFast,
    StoreFast,
    LoadDeref,
    StoreDeref,
    LoadGlobal,
    StoreGlobal,
    LoadAttr,
    StoreAttr,
    BinarySubscr,
    BinaryAdd,
    CompareLt,
    Jump,
    PopJumpIfFalse,
    PopJumpIfTrue,
    GetIter,
    ForIter,
    Call,
    ReturnValue,
    YieldValue,
    PushExcInfo,
    PopExcept,
    ExtendedArg,

    LoadAttrAdaptive,
    LoadGlobalAdaptive,
    BinarySubscrAdaptive,
    CallAdaptive,

    LoadAttrInstance,
    LoadGlobalModule,
    LoadGlobalBuiltin,
    BinarySubscrList,
    BinarySubscrMap,
    CallNative,
}

impl Opcode {
    pub fn from_u8(byte: u8) -> Option<Opcode> {
        use Opcode::*;
        Some(match byte {
            0 => Nop,
            1 => PopTop,
            2 => LoadConst,
            3 => LoadFast,
            4 => StoreFast,
            5 => LoadDeref,
            6 => StoreDeref,
            7 => LoadGlobal,
            8 => StoreGlobal,
            9 => LoadAttr,
            10 => StoreAttr,
            11 => BinarySubscr,
            12 => BinaryAdd,
            13 => CompareLt,
            14 => Jump,
            15 => PopJumpIfFalse,
            16 => PopJumpIfTrue,
            17 => GetIter,
            18 => ForIter,
            19 => Call,
            20 => ReturnValue,
            21 => YieldValue,
            22 => PushExcInfo,
            23 => PopExcept,
            24 => ExtendedArg,
            25 => LoadAttrAdaptive,
            26 => LoadGlobalAdaptive,
            27 => BinarySubscrAdaptive,
            28 => CallAdaptive,
            29 => LoadAttrInstance,
            30 => LoadGlobalModule,
            31 => LoadGlobalBuiltin,
            32 => BinarySubscrList,
            33 => BinarySubscrMap,
            34 => CallNative,
            _ => return None,
        })
    }

    /// Collapse adaptive and specialized forms back to their generic opcode.
    pub fn generic_form(self) -> Opcode {
        use Opcode::*;
        match self {
            LoadAttrAdaptive | LoadAttrInstance => LoadAttr,
            LoadGlobalAdaptive | LoadGlobalModule | LoadGlobalBuiltin => LoadGlobal,
            BinarySubscrAdaptive | BinarySubscrList | BinarySubscrMap => BinarySubscr,
            CallAdaptive | CallNative => Call,
            other => other,
        }
    }

    pub fn is_jump(self) -> bool {
        matches!(
            self,
            Opcode::Jump | Opcode::PopJumpIfFalse | Opcode::PopJumpIfTrue | Opcode::ForIter
        )
    }
}
