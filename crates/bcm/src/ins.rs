//! Bridge instructions: binary encoding, decoding and the text syntax used by the assembler.
//!
//! Instructions are little-endian 64-bit words with the opcode tag in bits [3:0] of the first
//! word. CFGW, LDFN, RCMD and WCMD take two words, every other instruction takes one.
use bitos::{
    TryBits, bitos,
    integer::{UnsignedInt, u2, u4, u5, u14},
};
use dhub::command::{CmdHeader, Command};
use easyerr::{Error, ResultExt};
use std::{fmt, str::FromStr};
use strum::{Display, EnumString, FromRepr};
use tinyvec::ArrayVec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
#[repr(u8)]
pub enum Opcode {
    Cfgw = 0x0,
    Ldfn = 0x1,
    Rcmd = 0x2,
    Wcmd = 0x3,
    Rdat = 0x4,
    Wdat = 0x5,
    Sema = 0x6,
    Null = 0xF,
}

impl Opcode {
    /// Length of the instruction in 64-bit words.
    pub fn words(self) -> usize {
        match self {
            Self::Cfgw | Self::Ldfn | Self::Rcmd | Self::Wcmd => 2,
            Self::Rdat | Self::Wdat | Self::Sema | Self::Null => 1,
        }
    }
}

/// Device access width of RDAT and WDAT.
#[bitos(2)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Byte = 0,
    Word = 1,
    Dword = 2,
}

impl Mode {
    pub fn width(self) -> usize {
        match self {
            Self::Byte => 1,
            Self::Word => 2,
            Self::Dword => 4,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Byte => "byte",
            Self::Word => "word",
            Self::Dword => "dword",
        }
    }
}

#[bitos(1)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endian {
    #[default]
    Little = 0,
    Big = 1,
}

impl Endian {
    fn name(self) -> &'static str {
        match self {
            Self::Little => "le",
            Self::Big => "be",
        }
    }
}

#[bitos(64)]
#[derive(Debug, Clone, Copy, Default)]
struct Head {
    #[bits(0..4)]
    tag: u4,
}

#[bitos(64)]
#[derive(Debug, Clone, Copy, Default)]
struct LdfnHead {
    #[bits(0..4)]
    tag: u4,
    #[bits(4..8)]
    channel: u4,
    #[bits(8)]
    interrupt: bool,
}

#[bitos(64)]
#[derive(Debug, Clone, Copy, Default)]
struct LdfnTarget {
    #[bits(0..32)]
    ddr_addr: u32,
    #[bits(32..48)]
    size: u16,
}

#[bitos(64)]
#[derive(Debug, Clone, Copy, Default)]
struct CfgwTarget {
    #[bits(0..32)]
    addr: u32,
    #[bits(32..64)]
    data: u32,
}

/// Single word layout of RDAT and WDAT. WDAT leaves `p_upd` reserved.
#[bitos(64)]
#[derive(Debug, Clone, Copy, Default)]
struct DataWord {
    #[bits(0..4)]
    tag: u4,
    #[bits(4..6)]
    mode: u2,
    #[bits(6)]
    endian: Endian,
    #[bits(7)]
    last: bool,
    #[bits(8..13)]
    c_upd: u5,
    #[bits(13..18)]
    p_upd: u5,
    #[bits(18..32)]
    size: u14,
    #[bits(32..64)]
    dev_addr: u32,
}

#[bitos(64)]
#[derive(Debug, Clone, Copy, Default)]
struct SemaWord {
    #[bits(0..4)]
    tag: u4,
    #[bits(4..9)]
    p_upd: u5,
    #[bits(9..14)]
    p_chk: u5,
    #[bits(14..19)]
    c_upd: u5,
    #[bits(19..24)]
    c_chk: u5,
}

const TAG_ONLY: u64 = !0xF;
const LDFN_HEAD_RESERVED: u64 = !0x1FF;
const LDFN_TARGET_RESERVED: u64 = !0xFFFF_FFFF_FFFF;
const CMD_RESERVED: u64 = (CmdHeader::RESERVED as u64) << 32;
const WDAT_RESERVED: u64 = 0x1F << 13;
const SEMA_RESERVED: u64 = !0xFF_FFFF;

/// Largest RDAT/WDAT size.
pub const MAX_DATA_SIZE: u16 = (1 << 14) - 1;

/// One RDAT or WDAT transfer between a data queue and a device register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DataMove {
    pub dev_addr: u32,
    pub size: u16,
    pub mode: Mode,
    pub endian: Endian,
    /// Release the device bus after this transfer.
    pub last: bool,
    /// Consumer semaphore checked and popped.
    pub c_upd: u8,
    /// Producer semaphore pushed. RDAT only.
    pub p_upd: u8,
}

/// The four independent sub-operations of SEMA. Zero skips a sub-operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SemaOps {
    pub p_upd: u8,
    pub p_chk: u8,
    pub c_upd: u8,
    pub c_chk: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ins {
    Cfgw {
        addr: u32,
        data: u32,
    },
    Ldfn {
        ddr_addr: u32,
        size: u16,
        channel: u8,
        interrupt: bool,
    },
    Rcmd(Command),
    Wcmd(Command),
    Rdat(DataMove),
    Wdat(DataMove),
    Sema(SemaOps),
    Null,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("instruction runs past the end of the stream")]
    Truncated,
    #[error("unknown opcode tag 0x{f0:X}")]
    UnknownOpcode(u8),
    #[error("{opcode} has reserved bits set (0x{bits:016X})")]
    Reserved { opcode: Opcode, bits: u64 },
    #[error("{f0} transfers zero bytes")]
    ZeroSize(Opcode),
    #[error("{opcode} size {size} is not a multiple of its {width} byte access width")]
    Unaligned {
        opcode: Opcode,
        size: u16,
        width: usize,
    },
    #[error("access mode 3 is invalid")]
    InvalidMode,
    #[error("{field} value {value} is out of range")]
    OutOfRange { field: &'static str, value: u32 },
}

fn check_reserved(opcode: Opcode, word: u64, mask: u64) -> Result<(), DecodeError> {
    let bits = word & mask;
    if bits != 0 {
        return Err(DecodeError::Reserved { opcode, bits });
    }

    Ok(())
}

fn check_range(field: &'static str, value: u32, max: u32) -> Result<(), DecodeError> {
    if value > max {
        return Err(DecodeError::OutOfRange { field, value });
    }

    Ok(())
}

impl DataMove {
    fn decode(word: u64) -> Result<Self, DecodeError> {
        let raw = DataWord::from_bits(word);
        let mode = Mode::try_from_bits(raw.mode()).ok_or(DecodeError::InvalidMode)?;

        Ok(Self {
            dev_addr: raw.dev_addr(),
            size: raw.size().value(),
            mode,
            endian: raw.endian(),
            last: raw.last(),
            c_upd: raw.c_upd().value(),
            p_upd: raw.p_upd().value(),
        })
    }

    fn encode(&self, opcode: Opcode) -> u64 {
        DataWord::default()
            .with_tag(u4::new(opcode as u8))
            .with_mode(u2::new(self.mode as u8))
            .with_endian(self.endian)
            .with_last(self.last)
            .with_c_upd(u5::new(self.c_upd & 0x1F))
            .with_p_upd(u5::new(self.p_upd & 0x1F))
            .with_size(u14::new(self.size & MAX_DATA_SIZE))
            .with_dev_addr(self.dev_addr)
            .to_bits()
    }

    fn validate(&self, opcode: Opcode) -> Result<(), DecodeError> {
        check_range("cupd", self.c_upd as u32, 31)?;
        check_range("pupd", self.p_upd as u32, 31)?;
        check_range("size", self.size as u32, MAX_DATA_SIZE as u32)?;
        if opcode == Opcode::Wdat && self.p_upd != 0 {
            return Err(DecodeError::Reserved {
                opcode,
                bits: (self.p_upd as u64) << 13,
            });
        }

        if self.size == 0 {
            return Err(DecodeError::ZeroSize(opcode));
        }

        let width = self.mode.width();
        if self.size as usize % width != 0 {
            return Err(DecodeError::Unaligned {
                opcode,
                size: self.size,
                width,
            });
        }

        Ok(())
    }
}

impl Ins {
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::Cfgw { .. } => Opcode::Cfgw,
            Self::Ldfn { .. } => Opcode::Ldfn,
            Self::Rcmd(_) => Opcode::Rcmd,
            Self::Wcmd(_) => Opcode::Wcmd,
            Self::Rdat(_) => Opcode::Rdat,
            Self::Wdat(_) => Opcode::Wdat,
            Self::Sema(_) => Opcode::Sema,
            Self::Null => Opcode::Null,
        }
    }

    /// Decodes the instruction at the start of `words`, returning it and its length in words.
    pub fn decode(words: &[u64]) -> Result<(Self, usize), DecodeError> {
        let &first = words.first().ok_or(DecodeError::Truncated)?;
        let tag = Head::from_bits(first).tag().value();
        let opcode = Opcode::from_repr(tag).ok_or(DecodeError::UnknownOpcode(tag))?;

        let len = opcode.words();
        if words.len() < len {
            return Err(DecodeError::Truncated);
        }

        let second = words.get(1).copied().unwrap_or_default();
        let ins = match opcode {
            Opcode::Cfgw => {
                check_reserved(opcode, first, TAG_ONLY)?;
                let target = CfgwTarget::from_bits(second);
                Self::Cfgw {
                    addr: target.addr(),
                    data: target.data(),
                }
            }
            Opcode::Ldfn => {
                check_reserved(opcode, first, LDFN_HEAD_RESERVED)?;
                check_reserved(opcode, second, LDFN_TARGET_RESERVED)?;
                let head = LdfnHead::from_bits(first);
                let target = LdfnTarget::from_bits(second);
                Self::Ldfn {
                    ddr_addr: target.ddr_addr(),
                    size: target.size(),
                    channel: head.channel().value(),
                    interrupt: head.interrupt(),
                }
            }
            Opcode::Rcmd | Opcode::Wcmd => {
                check_reserved(opcode, first, TAG_ONLY)?;
                check_reserved(opcode, second, CMD_RESERVED)?;
                let cmd = Command::from_bits(second);
                if opcode == Opcode::Rcmd {
                    Self::Rcmd(cmd)
                } else {
                    Self::Wcmd(cmd)
                }
            }
            Opcode::Rdat => Self::Rdat(DataMove::decode(first)?),
            Opcode::Wdat => {
                check_reserved(opcode, first, WDAT_RESERVED)?;
                Self::Wdat(DataMove::decode(first)?)
            }
            Opcode::Sema => {
                check_reserved(opcode, first, SEMA_RESERVED)?;
                let word = SemaWord::from_bits(first);
                Self::Sema(SemaOps {
                    p_upd: word.p_upd().value(),
                    p_chk: word.p_chk().value(),
                    c_upd: word.c_upd().value(),
                    c_chk: word.c_chk().value(),
                })
            }
            Opcode::Null => {
                check_reserved(opcode, first, TAG_ONLY)?;
                Self::Null
            }
        };

        ins.validate()?;
        Ok((ins, len))
    }

    /// Checks the semantic constraints that the encoding alone cannot express.
    pub fn validate(&self) -> Result<(), DecodeError> {
        match self {
            Self::Ldfn { size, channel, .. } => {
                check_range("ch", *channel as u32, 15)?;
                if *size == 0 {
                    return Err(DecodeError::ZeroSize(Opcode::Ldfn));
                }
            }
            Self::Rcmd(cmd) | Self::Wcmd(cmd) => {
                if cmd.validate().is_err() {
                    return Err(DecodeError::ZeroSize(self.opcode()));
                }
            }
            Self::Rdat(mv) | Self::Wdat(mv) => mv.validate(self.opcode())?,
            Self::Sema(ops) => {
                check_range("pupd", ops.p_upd as u32, 31)?;
                check_range("pchk", ops.p_chk as u32, 31)?;
                check_range("cupd", ops.c_upd as u32, 31)?;
                check_range("cchk", ops.c_chk as u32, 31)?;
            }
            Self::Cfgw { .. } | Self::Null => (),
        }

        Ok(())
    }

    pub fn encode(&self) -> ArrayVec<[u64; 2]> {
        let tag = self.opcode() as u64;
        let mut words = ArrayVec::new();
        match self {
            Self::Cfgw { addr, data } => {
                words.push(tag);
                words.push(CfgwTarget::default().with_addr(*addr).with_data(*data).to_bits());
            }
            Self::Ldfn {
                ddr_addr,
                size,
                channel,
                interrupt,
            } => {
                let head = LdfnHead::default()
                    .with_tag(u4::new(Opcode::Ldfn as u8))
                    .with_channel(u4::new(channel & 0xF))
                    .with_interrupt(*interrupt);
                let target = LdfnTarget::default()
                    .with_ddr_addr(*ddr_addr)
                    .with_size(*size);

                words.push(head.to_bits());
                words.push(target.to_bits());
            }
            Self::Rcmd(cmd) | Self::Wcmd(cmd) => {
                words.push(tag);
                words.push(cmd.to_bits());
            }
            Self::Rdat(mv) | Self::Wdat(mv) => words.push(mv.encode(self.opcode())),
            Self::Sema(ops) => {
                let word = SemaWord::default()
                    .with_tag(u4::new(Opcode::Sema as u8))
                    .with_p_upd(u5::new(ops.p_upd & 0x1F))
                    .with_p_chk(u5::new(ops.p_chk & 0x1F))
                    .with_c_upd(u5::new(ops.c_upd & 0x1F))
                    .with_c_chk(u5::new(ops.c_chk & 0x1F));

                words.push(word.to_bits());
            }
            Self::Null => words.push(tag),
        }

        words
    }
}

fn fmt_cmd(f: &mut fmt::Formatter<'_>, opcode: Opcode, cmd: &Command) -> fmt::Result {
    let header = cmd.header;
    write!(
        f,
        "{opcode} addr=0x{:X} size={} chk={} upd={}",
        cmd.addr,
        header.size(),
        header.chk_sem_id().value(),
        header.upd_sem_id().value()
    )?;

    if header.size_unit() == dhub::command::SizeUnit::Mtu {
        write!(f, " unit=mtu")?;
    }

    if header.sem_op() == dhub::command::SemOp::PerMtu {
        write!(f, " semop=mtu")?;
    }

    if header.interrupt() {
        write!(f, " intr=1")?;
    }

    Ok(())
}

impl fmt::Display for Ins {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let opcode = self.opcode();
        match self {
            Self::Cfgw { addr, data } => write!(f, "{opcode} addr=0x{addr:X} data=0x{data:X}"),
            Self::Ldfn {
                ddr_addr,
                size,
                channel,
                interrupt,
            } => write!(
                f,
                "{opcode} addr=0x{ddr_addr:X} size={size} ch={channel} intr={}",
                *interrupt as u8
            ),
            Self::Rcmd(cmd) | Self::Wcmd(cmd) => fmt_cmd(f, opcode, cmd),
            Self::Rdat(mv) | Self::Wdat(mv) => {
                write!(
                    f,
                    "{opcode} dev=0x{:X} size={} mode={} endian={} last={} cupd={}",
                    mv.dev_addr,
                    mv.size,
                    mv.mode.name(),
                    mv.endian.name(),
                    mv.last as u8,
                    mv.c_upd
                )?;

                if opcode == Opcode::Rdat {
                    write!(f, " pupd={}", mv.p_upd)?;
                }

                Ok(())
            }
            Self::Sema(ops) => write!(
                f,
                "{opcode} pupd={} pchk={} cupd={} cchk={}",
                ops.p_upd, ops.p_chk, ops.c_upd, ops.c_chk
            ),
            Self::Null => write!(f, "{opcode}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("empty instruction")]
    Empty,
    #[error("unknown mnemonic {f0:?}")]
    UnknownMnemonic(String),
    #[error("argument {f0:?} is not of the form key=value")]
    MissingValue(String),
    #[error("unexpected argument {f0:?}")]
    UnknownKey(String),
    #[error("bad value {value:?} for {key}")]
    BadValue { key: String, value: String },
    #[error(transparent)]
    Invalid { source: DecodeError },
}

/// `key=value` arguments of one instruction.
struct Args<'a> {
    pairs: Vec<(&'a str, &'a str)>,
}

impl<'a> Args<'a> {
    fn new(tokens: impl Iterator<Item = &'a str>) -> Result<Self, ParseError> {
        let pairs = tokens
            .map(|token| {
                token
                    .split_once('=')
                    .ok_or_else(|| ParseError::MissingValue(token.to_owned()))
            })
            .collect::<Result<_, _>>()?;

        Ok(Self { pairs })
    }

    fn take(&mut self, key: &str) -> Option<&'a str> {
        let index = self.pairs.iter().position(|(k, _)| *k == key)?;
        Some(self.pairs.swap_remove(index).1)
    }

    fn bad(key: &str, value: &str) -> ParseError {
        ParseError::BadValue {
            key: key.to_owned(),
            value: value.to_owned(),
        }
    }

    /// Numeric argument, decimal or `0x` hex, zero when absent.
    fn num(&mut self, key: &str, max: u64) -> Result<u64, ParseError> {
        let Some(text) = self.take(key) else {
            return Ok(0);
        };

        let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
            Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16),
            None => text.replace('_', "").parse(),
        };

        match parsed {
            Ok(value) if value <= max => Ok(value),
            _ => Err(Self::bad(key, text)),
        }
    }

    fn flag(&mut self, key: &str) -> Result<bool, ParseError> {
        Ok(self.num(key, 1)? == 1)
    }

    fn word(&mut self, key: &str, choices: &[&str]) -> Result<usize, ParseError> {
        let Some(text) = self.take(key) else {
            return Ok(0);
        };

        choices
            .iter()
            .position(|c| c.eq_ignore_ascii_case(text))
            .ok_or_else(|| Self::bad(key, text))
    }

    fn finish(self) -> Result<(), ParseError> {
        match self.pairs.first() {
            Some((key, _)) => Err(ParseError::UnknownKey((*key).to_owned())),
            None => Ok(()),
        }
    }
}

fn parse_cmd(args: &mut Args) -> Result<Command, ParseError> {
    use dhub::command::{SemOp, SizeUnit};

    let addr = args.num("addr", u32::MAX as u64)? as u32;
    let header = CmdHeader::bytes(args.num("size", u16::MAX as u64)? as u16)
        .with_chk_sem_id(u5::new(args.num("chk", 31)? as u8))
        .with_upd_sem_id(u5::new(args.num("upd", 31)? as u8))
        .with_size_unit(if args.word("unit", &["bytes", "mtu"])? == 1 {
            SizeUnit::Mtu
        } else {
            SizeUnit::Bytes
        })
        .with_sem_op(if args.word("semop", &["cmd", "mtu"])? == 1 {
            SemOp::PerMtu
        } else {
            SemOp::PerCommand
        })
        .with_interrupt(args.flag("intr")?);

    Ok(Command::new(addr, header))
}

fn parse_move(args: &mut Args, opcode: Opcode) -> Result<DataMove, ParseError> {
    let mode = match args.word("mode", &["byte", "word", "dword"])? {
        0 => Mode::Byte,
        1 => Mode::Word,
        _ => Mode::Dword,
    };

    let endian = match args.word("endian", &["le", "be"])? {
        0 => Endian::Little,
        _ => Endian::Big,
    };

    Ok(DataMove {
        dev_addr: args.num("dev", u32::MAX as u64)? as u32,
        size: args.num("size", MAX_DATA_SIZE as u64)? as u16,
        mode,
        endian,
        last: args.flag("last")?,
        c_upd: args.num("cupd", 31)? as u8,
        p_upd: if opcode == Opcode::Rdat {
            args.num("pupd", 31)? as u8
        } else {
            0
        },
    })
}

impl FromStr for Ins {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut tokens = s.split_whitespace();
        let mnemonic = tokens.next().ok_or(ParseError::Empty)?;
        let opcode = Opcode::from_str(&mnemonic.to_ascii_lowercase())
            .map_err(|_| ParseError::UnknownMnemonic(mnemonic.to_owned()))?;

        let mut args = Args::new(tokens)?;
        let ins = match opcode {
            Opcode::Cfgw => Self::Cfgw {
                addr: args.num("addr", u32::MAX as u64)? as u32,
                data: args.num("data", u32::MAX as u64)? as u32,
            },
            Opcode::Ldfn => Self::Ldfn {
                ddr_addr: args.num("addr", u32::MAX as u64)? as u32,
                size: args.num("size", u16::MAX as u64)? as u16,
                channel: args.num("ch", 15)? as u8,
                interrupt: args.flag("intr")?,
            },
            Opcode::Rcmd => Self::Rcmd(parse_cmd(&mut args)?),
            Opcode::Wcmd => Self::Wcmd(parse_cmd(&mut args)?),
            Opcode::Rdat => Self::Rdat(parse_move(&mut args, opcode)?),
            Opcode::Wdat => Self::Wdat(parse_move(&mut args, opcode)?),
            Opcode::Sema => Self::Sema(SemaOps {
                p_upd: args.num("pupd", 31)? as u8,
                p_chk: args.num("pchk", 31)? as u8,
                c_upd: args.num("cupd", 31)? as u8,
                c_chk: args.num("cchk", 31)? as u8,
            }),
            Opcode::Null => Self::Null,
        };

        args.finish()?;
        ins.validate().context(ParseCtx::Invalid)?;
        Ok(ins)
    }
}

#[derive(Debug, Error)]
#[error("line {line}: {source}")]
pub struct AssembleError {
    pub line: usize,
    pub source: ParseError,
}

/// Assembles a program, one instruction per line. `#` starts a comment.
pub fn assemble(text: &str) -> Result<Vec<u64>, AssembleError> {
    let mut words = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let code = line.split('#').next().unwrap_or_default().trim();
        if code.is_empty() {
            continue;
        }

        let ins: Ins = code.parse().map_err(|source| AssembleError {
            line: index + 1,
            source,
        })?;

        words.extend(ins.encode());
    }

    Ok(words)
}

/// Splits a little-endian image into instruction words. A trailing partial word is dropped.
pub fn words(image: &[u8]) -> Vec<u64> {
    image
        .chunks_exact(8)
        .map(|chunk| {
            let mut word = [0; 8];
            word.copy_from_slice(chunk);
            u64::from_le_bytes(word)
        })
        .collect()
}

/// Inverse of [`words`].
pub fn bytes(words: &[u64]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

/// Decodes a whole program. Stops at the first word that does not decode.
pub fn disassemble(words: &[u64]) -> (Vec<(usize, Ins)>, Option<(usize, DecodeError)>) {
    let mut listing = Vec::new();
    let mut pc = 0;
    while pc < words.len() {
        match Ins::decode(&words[pc..]) {
            Ok((ins, len)) => {
                listing.push((pc, ins));
                pc += len;
            }
            Err(e) => return (listing, Some((pc, e))),
        }
    }

    (listing, None)
}
