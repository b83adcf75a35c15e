// Definitions of opcode fields; rather than have magic numbers everywhere,
// we opt for rich types wherever it is not too ridiculous. The parser is
// the naturally messy code responsible for constructing said rich types.

use crate::conversions::Truncate;
use crate::processor::{CCRFlags, CCR, CPU};
use std::fmt;
use std::mem::discriminant;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Size {
    Byte = 1,
    Word = 2,
    Long = 4,
}

impl Size {
    pub fn from<T>(&self, res: T) -> OpResult
    where
        T: Truncate<u8> + Truncate<u16> + Truncate<u32>,
    {
        match *self {
            Self::Byte => OpResult::Byte(res.truncate()),
            Self::Word => OpResult::Word(res.truncate()),
            Self::Long => OpResult::Long(res.truncate()),
        }
    }
    pub fn zero(&self) -> OpResult {
        self.from(0u8)
    }
    pub fn from_opcode(size: usize) -> Self {
        match size {
            0 => Self::Byte,
            1 => Self::Word,
            2 => Self::Long,
            _ => panic!("illegal operand size"),
        }
    }
    pub fn mask(&self) -> u32 {
        match *self {
            Self::Byte => 0xff,
            Self::Word => 0xffff,
            Self::Long => 0xffff_ffff,
        }
    }
    pub fn msb(&self) -> u32 {
        match *self {
            Self::Byte => 0x80,
            Self::Word => 0x8000,
            Self::Long => 0x8000_0000,
        }
    }
    pub fn bits(&self) -> u32 {
        8 * (*self as u32)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpResult {
    Byte(u8),
    Word(u16),
    Long(u32),
}

impl OpResult {
    pub fn inner(&self) -> u32 {
        match *self {
            Self::Byte(b) => b as u32,
            Self::Word(w) => w as u32,
            Self::Long(l) => l,
        }
    }
    pub fn sign_extend(&self) -> i32 {
        match *self {
            Self::Byte(b) => b as i8 as i32,
            Self::Word(w) => w as i16 as i32,
            Self::Long(l) => l as i32,
        }
    }
    pub fn size(&self) -> Size {
        match self {
            Self::Byte(_) => Size::Byte,
            Self::Word(_) => Size::Word,
            Self::Long(_) => Size::Long,
        }
    }
    pub fn msb(&self) -> bool {
        self.inner() & self.size().msb() != 0
    }
    pub fn is_zero(&self) -> bool {
        self.inner() == 0
    }

    /// `self + src (+ X)`, with `self` as destination. The overflow and
    /// carry conditions are evaluated on the operand sign bits.
    pub fn add(&self, src: OpResult, extend: bool) -> (Self, CCRFlags) {
        let size = self.size();
        let d = self.inner();
        let s = src.inner() & size.mask();
        let r = d.wrapping_add(s).wrapping_add(extend as u32) & size.mask();
        let m = size.msb();
        let mut ccr = CCRFlags::new();
        let overflow = ((s & d & !r) | (!s & !d & r)) & m != 0;
        let carry = ((s & d) | (!r & d) | (s & !r)) & m != 0;
        ccr.n = Some(r & m != 0);
        ccr.z = Some(r == 0);
        ccr.v = Some(overflow);
        ccr.c = Some(carry);
        ccr.x = Some(carry);
        (size.from(r), ccr)
    }

    /// `self - src (- X)`, with `self` as destination.
    pub fn sub(&self, src: OpResult, extend: bool) -> (Self, CCRFlags) {
        let size = self.size();
        let d = self.inner();
        let s = src.inner() & size.mask();
        let r = d.wrapping_sub(s).wrapping_sub(extend as u32) & size.mask();
        let m = size.msb();
        let mut ccr = CCRFlags::new();
        let overflow = ((!s & d & !r) | (s & !d & r)) & m != 0;
        let borrow = ((s & !d) | (r & !d) | (s & r)) & m != 0;
        ccr.n = Some(r & m != 0);
        ccr.z = Some(r == 0);
        ccr.v = Some(overflow);
        ccr.c = Some(borrow);
        ccr.x = Some(borrow);
        (size.from(r), ccr)
    }

    /// ADDX/SUBX/NEGX accumulate Z across a multi-precision chain: the
    /// flag is cleared by a nonzero result and otherwise left alone.
    pub fn add_extended(&self, src: OpResult, extend: bool) -> (Self, CCRFlags) {
        let (res, mut ccr) = self.add(src, extend);
        ccr.z = if res.is_zero() { None } else { Some(false) };
        (res, ccr)
    }
    pub fn sub_extended(&self, src: OpResult, extend: bool) -> (Self, CCRFlags) {
        let (res, mut ccr) = self.sub(src, extend);
        ccr.z = if res.is_zero() { None } else { Some(false) };
        (res, ccr)
    }

    pub fn and(&self, other: Self) -> (Self, CCRFlags) {
        self.bitwise_op(other, |a, b| a & b)
    }
    pub fn or(&self, other: Self) -> (Self, CCRFlags) {
        self.bitwise_op(other, |a, b| a | b)
    }
    pub fn xor(&self, other: Self) -> (Self, CCRFlags) {
        self.bitwise_op(other, |a, b| a ^ b)
    }
    pub fn not(&self) -> (Self, CCRFlags) {
        self.bitwise_op(*self, |a, _| !a)
    }
    pub fn clear(&self) -> (Self, CCRFlags) {
        self.bitwise_op(*self, |_, _| 0)
    }
    /// Logical-result flags: N and Z from the value, V and C cleared.
    pub fn logic_flags(&self) -> CCRFlags {
        let mut ccr = CCRFlags::new();
        ccr.n = Some(self.msb());
        ccr.z = Some(self.is_zero());
        ccr.v = Some(false);
        ccr.c = Some(false);
        ccr
    }
    fn bitwise_op<T>(&self, other: Self, fun: T) -> (Self, CCRFlags)
    where
        T: Fn(u32, u32) -> u32,
    {
        let size = self.size();
        let res = size.from(fun(self.inner(), other.inner()) & size.mask());
        let ccr = res.logic_flags();
        (res, ccr)
    }

    pub fn to_be_bytes(&self) -> Vec<u8> {
        let value = self.inner();
        let size = self.size() as usize;
        (0..size).map(|j| (value >> (8 * (size - j - 1))) as u8).collect()
    }
}

impl fmt::Display for OpResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            OpResult::Byte(b) => write!(f, "${:02x}", b),
            OpResult::Word(w) => write!(f, "${:04x}", w),
            OpResult::Long(l) => write!(f, "${:08x}", l),
        }
    }
}

/// The MC68000 effective addressing modes. The decode-time constructor
/// consumes any extension words from the instruction stream, so a
/// constructed `EAMode` is self-contained.
#[derive(Debug, Copy, Clone)]
pub enum EAMode {
    // Data register direct mode
    DataDirect(usize),
    // Address register direct mode
    AddressDirect(usize),
    // Address register indirect mode
    AddressIndirect(usize),
    // Address register indirect with postincrement mode
    AddressPostincr(usize, Size),
    // Address register indirect with predecrement mode
    AddressPredecr(usize, Size),
    // Address register indirect with displacement mode
    AddressDisplacement(usize, i16),
    // Address register indirect with index (brief extension word)
    AddressIndex(usize, usize, i8, Size, usize),
    // Absolute short addressing mode
    AbsoluteShort(u32),
    // Absolute long addressing mode
    AbsoluteLong(u32),
    // Program counter indirect with displacement mode
    PCDisplacement(i16, u32),
    // Program counter indirect with index (brief extension word)
    PCIndex(usize, i8, Size, usize, u32),
    // Immediate data
    Immediate(OpResult),
}

impl EAMode {
    pub fn from(size: Size, mode: usize, earegister: usize, cpu: &mut CPU) -> Self {
        match mode {
            0 => Self::DataDirect(earegister),
            1 => Self::AddressDirect(earegister),
            2 => Self::AddressIndirect(earegister),
            3 => Self::AddressPostincr(earegister, size),
            4 => Self::AddressPredecr(earegister, size),
            5 => Self::AddressDisplacement(earegister, cpu.next_instruction() as i16),
            6 => {
                // Brief extension word; the 68000 has no full format.
                let ext = cpu.next_instruction();
                let (da, iregister, index_size, displacement) = brief_extension(ext);
                Self::AddressIndex(earegister, iregister, displacement, index_size, da)
            }
            7 => {
                match earegister {
                    0 => Self::AbsoluteShort(cpu.next_instruction() as i16 as u32),
                    1 => {
                        let hi = cpu.next_instruction() as u32;
                        let lo = cpu.next_instruction() as u32;
                        Self::AbsoluteLong((hi << 16) | lo)
                    }
                    2 => {
                        let base = cpu.pc;
                        Self::PCDisplacement(cpu.next_instruction() as i16, base)
                    }
                    3 => {
                        let base = cpu.pc;
                        let ext = cpu.next_instruction();
                        let (da, iregister, index_size, displacement) = brief_extension(ext);
                        Self::PCIndex(iregister, displacement, index_size, da, base)
                    }
                    4 => Self::Immediate(cpu.immediate_operand(size)),
                    _ => panic!("invalid register field"),
                }
            }
            _ => panic!("invalid addressing mode"),
        }
    }
    pub fn is_address_register(&self) -> bool {
        matches!(*self, Self::AddressDirect(_))
    }
    pub fn is_register(&self) -> bool {
        matches!(*self, Self::DataDirect(_) | Self::AddressDirect(_))
    }
}

fn brief_extension(ext: u16) -> (usize, usize, Size, i8) {
    let da = ((ext >> 15) & 1) as usize;
    let iregister = ((ext >> 12) & 7) as usize;
    let index_size = if ext & 0x0800 != 0 { Size::Long } else { Size::Word };
    let displacement = (ext & 0xff) as i8;
    (da, iregister, index_size, displacement)
}

impl PartialEq for EAMode {
    fn eq(&self, other: &EAMode) -> bool {
        discriminant(self) == discriminant(other)
    }
}

#[derive(Debug, Copy, Clone)]
pub enum Condition {
    T = 0,
    F = 1,
    HI = 2,
    LS = 3,
    CC = 4,
    CS = 5,
    NE = 6,
    EQ = 7,
    VC = 8,
    VS = 9,
    PL = 10,
    MI = 11,
    GE = 12,
    LT = 13,
    GT = 14,
    LE = 15,
}

impl Condition {
    pub fn from(condition: usize) -> Self {
        match condition {
            0 => Self::T,
            1 => Self::F,
            2 => Self::HI,
            3 => Self::LS,
            4 => Self::CC,
            5 => Self::CS,
            6 => Self::NE,
            7 => Self::EQ,
            8 => Self::VC,
            9 => Self::VS,
            10 => Self::PL,
            11 => Self::MI,
            12 => Self::GE,
            13 => Self::LT,
            14 => Self::GT,
            15 => Self::LE,
            _ => panic!("invalid condition code"),
        }
    }
    pub fn evaluate(&self, cpu: &CPU) -> bool {
        let n = cpu.ccr(CCR::N);
        let z = cpu.ccr(CCR::Z);
        let v = cpu.ccr(CCR::V);
        let c = cpu.ccr(CCR::C);
        match *self {
            Self::T => true,
            Self::F => false,
            Self::HI => !c && !z,
            Self::LS => c || z,
            Self::CC => !c,
            Self::CS => c,
            Self::NE => !z,
            Self::EQ => z,
            Self::VC => !v,
            Self::VS => v,
            Self::PL => !n,
            Self::MI => n,
            Self::GE => n == v,
            Self::LT => n != v,
            Self::GT => !z && (n == v),
            Self::LE => z || (n != v),
        }
    }
}

#[derive(Copy, Clone)]
pub enum OpMode {
    MemoryToRegister(Size),
    RegisterToMemory(Size),
}

impl OpMode {
    pub fn from_opcode(opmode: usize) -> Self {
        let size = Size::from_opcode(opmode % 4);
        match opmode >> 2 {
            0 => Self::MemoryToRegister(size),
            1 => Self::RegisterToMemory(size),
            _ => panic!("invalid opmode"),
        }
    }
    pub fn size(&self) -> Size {
        match *self {
            Self::MemoryToRegister(size) | Self::RegisterToMemory(size) => size,
        }
    }
}

/// Binary coded decimal byte arithmetic for ABCD/SBCD/NBCD.
pub struct PackedBCD(pub u8);

impl PackedBCD {
    pub fn from(res: OpResult) -> Self {
        match res {
            OpResult::Byte(b) => Self(b),
            _ => panic!("BCD arithmetic is byte sized"),
        }
    }
    pub fn add(&self, other: Self, extend: bool) -> (OpResult, bool) {
        let mut carry = 0;
        let mut low = (self.0 & 0xf) + (other.0 & 0xf) + extend as u8;
        if low > 9 {
            low -= 10;
            carry = 1;
        }
        let mut high = (self.0 >> 4) + (other.0 >> 4) + carry;
        if high > 9 {
            high -= 10;
            carry = 1;
        } else {
            carry = 0;
        }
        (OpResult::Byte(low | (high << 4)), carry != 0)
    }
    pub fn sub(&self, other: Self, extend: bool) -> (OpResult, bool) {
        let mut borrow = 0;
        let mut low = (self.0 & 0xf) as i8 - (other.0 & 0xf) as i8 - extend as i8;
        if low < 0 {
            low += 10;
            borrow = 1;
        }
        let mut high = (self.0 >> 4) as i8 - (other.0 >> 4) as i8 - borrow;
        if high < 0 {
            high += 10;
            borrow = 1;
        } else {
            borrow = 0;
        }
        (OpResult::Byte((low as u8) | ((high as u8) << 4)), borrow != 0)
    }
}
