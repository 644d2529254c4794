//! Conditional branch kinds and their reversal table.
//!
//! x86-64 conditional jumps test one of sixteen flag conditions, which come in
//! complementary pairs. The count-register test family (`JRCXZ`, `JECXZ`,
//! `JCXZ`) and the `LOOP` family do not look at the flags at all and have no
//! complementary encoding, so they are never reversed.

use iced_x86::{Code, Mnemonic};

/// A flag condition tested by a `Jcc` instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConditionCode {
    /// Overflow (`JO`).
    Overflow,
    /// No overflow (`JNO`).
    NotOverflow,
    /// Below, unsigned `<` (`JB`).
    Below,
    /// Not below, unsigned `>=` (`JNB`/`JAE`).
    NotBelow,
    /// Zero / equal (`JZ`/`JE`).
    Zero,
    /// Not zero / not equal (`JNZ`/`JNE`).
    NotZero,
    /// Below or equal (`JBE`).
    BelowOrEqual,
    /// Not below or equal, unsigned `>` (`JNBE`/`JA`).
    NotBelowOrEqual,
    /// Sign (`JS`).
    Sign,
    /// No sign (`JNS`).
    NotSign,
    /// Parity (`JP`).
    Parity,
    /// No parity (`JNP`).
    NotParity,
    /// Less, signed `<` (`JL`).
    Less,
    /// Not less, signed `>=` (`JNL`/`JGE`).
    NotLess,
    /// Less or equal (`JLE`).
    LessOrEqual,
    /// Not less or equal, signed `>` (`JNLE`/`JG`).
    NotLessOrEqual,
}

impl ConditionCode {
    /// The condition that holds exactly when `self` does not.
    pub const fn complement(self) -> Self {
        use ConditionCode::*;
        match self {
            Overflow => NotOverflow,
            NotOverflow => Overflow,
            Below => NotBelow,
            NotBelow => Below,
            Zero => NotZero,
            NotZero => Zero,
            BelowOrEqual => NotBelowOrEqual,
            NotBelowOrEqual => BelowOrEqual,
            Sign => NotSign,
            NotSign => Sign,
            Parity => NotParity,
            NotParity => Parity,
            Less => NotLess,
            NotLess => Less,
            LessOrEqual => NotLessOrEqual,
            NotLessOrEqual => LessOrEqual,
        }
    }

    /// The `Jcc rel32` encoding for this condition in 64-bit mode.
    pub const fn near_code(self) -> Code {
        use ConditionCode::*;
        match self {
            Overflow => Code::Jo_rel32_64,
            NotOverflow => Code::Jno_rel32_64,
            Below => Code::Jb_rel32_64,
            NotBelow => Code::Jae_rel32_64,
            Zero => Code::Je_rel32_64,
            NotZero => Code::Jne_rel32_64,
            BelowOrEqual => Code::Jbe_rel32_64,
            NotBelowOrEqual => Code::Ja_rel32_64,
            Sign => Code::Js_rel32_64,
            NotSign => Code::Jns_rel32_64,
            Parity => Code::Jp_rel32_64,
            NotParity => Code::Jnp_rel32_64,
            Less => Code::Jl_rel32_64,
            NotLess => Code::Jge_rel32_64,
            LessOrEqual => Code::Jle_rel32_64,
            NotLessOrEqual => Code::Jg_rel32_64,
        }
    }

    /// All sixteen flag conditions.
    pub const ALL: [ConditionCode; 16] = {
        use ConditionCode::*;
        [
            Overflow,
            NotOverflow,
            Below,
            NotBelow,
            Zero,
            NotZero,
            BelowOrEqual,
            NotBelowOrEqual,
            Sign,
            NotSign,
            Parity,
            NotParity,
            Less,
            NotLess,
            LessOrEqual,
            NotLessOrEqual,
        ]
    };
}

/// What a conditional branch tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Condition {
    /// A flag condition (`Jcc`).
    Flags(ConditionCode),
    /// The count register is zero (`JRCXZ`, `JECXZ`, `JCXZ`).
    CountRegisterZero,
    /// Any other conditional branch (`LOOP`, `LOOPE`, `LOOPNE`).
    Other,
}

impl Condition {
    /// Classify a conditional branch by its mnemonic.
    pub fn from_mnemonic(mnemonic: Mnemonic) -> Self {
        use ConditionCode::*;
        let cc = match mnemonic {
            Mnemonic::Jo => Overflow,
            Mnemonic::Jno => NotOverflow,
            Mnemonic::Jb => Below,
            Mnemonic::Jae => NotBelow,
            Mnemonic::Je => Zero,
            Mnemonic::Jne => NotZero,
            Mnemonic::Jbe => BelowOrEqual,
            Mnemonic::Ja => NotBelowOrEqual,
            Mnemonic::Js => Sign,
            Mnemonic::Jns => NotSign,
            Mnemonic::Jp => Parity,
            Mnemonic::Jnp => NotParity,
            Mnemonic::Jl => Less,
            Mnemonic::Jge => NotLess,
            Mnemonic::Jle => LessOrEqual,
            Mnemonic::Jg => NotLessOrEqual,
            Mnemonic::Jrcxz | Mnemonic::Jecxz | Mnemonic::Jcxz => {
                return Condition::CountRegisterZero
            }
            _ => return Condition::Other,
        };
        Condition::Flags(cc)
    }

    /// The code of the opposite condition, if one can be expressed by
    /// inverting the condition code.
    pub fn reversed(self) -> Option<ConditionCode> {
        match self {
            Condition::Flags(cc) => Some(cc.complement()),
            Condition::CountRegisterZero | Condition::Other => None,
        }
    }
}
