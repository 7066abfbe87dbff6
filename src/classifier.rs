//! Protected-call classification.
//!
//! The classifier walks the code byte by byte, decoding one instruction at
//! every position so that misaligned code resynchronises on its own. Only
//! three shapes are of interest:
//!
//! ```text
//! call rel32        ; E8 xx xx xx xx
//! jmp  rel8/rel32   ; EB xx / E9 xx xx xx xx
//! mov  eax, imm32   ; B8 xx xx xx xx   (imm is a virtual address)
//! ```
//!
//! When the branch target is a known protected entry point, the call site is
//! categorised by what follows it:
//!
//! ```text
//! call protected      call protected      call protected      call protected
//! ret / mov ...       jmp eax             call eax            <anything else>
//!   -> Constant         -> StolenV2         -> StolenV1 (old)   -> StolenV3
//! ```
//!
//! Every record carries the patch target, the redirect EIP and the breakpoint
//! address, all as virtual addresses.

use std::collections::{BTreeMap, HashSet};

use iced_x86::{Decoder, DecoderOptions, Instruction, Mnemonic, OpKind, Register};
use tracing::{debug, trace};

use crate::catalog::{CatalogEntry, Category, EntryRecord, UNRESOLVED};
use crate::pe::BinaryImage;
use crate::scanner::{self, Pattern};
use crate::signatures::{SignatureSet, SCAN_WINDOW};

/// Longest x86 instruction.
const MAX_INSTRUCTION_LEN: usize = 15;

/// Length of `call rel32` / `mov eax, imm32`.
const CALL_LEN: usize = 5;

const OP_RET: u8 = 0xC3;
const OP_MOV_RM: u8 = 0x89;
const OP_PUSH_ECX: u8 = 0x51;
const OP_JMP_SHORT: u8 = 0xEB;
const CALL_EAX: [u8; 2] = [0xFF, 0xD0];
const JMP_EAX: [u8; 2] = [0xFF, 0xE0];

/// Addresses recorded for one protected call site.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProtectedRecord {
    pub prologue: u32,
    pub eip: u32,
    pub bp: u32,
}

/// Classifier output: records per category, keyed by protected function VA.
///
/// Keys are sorted; records under one key keep discovery order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Classification {
    pub constant: BTreeMap<u32, Vec<ProtectedRecord>>,
    pub stolen_v1: BTreeMap<u32, Vec<ProtectedRecord>>,
    pub stolen_v2: BTreeMap<u32, Vec<ProtectedRecord>>,
    pub stolen_v3: BTreeMap<u32, Vec<ProtectedRecord>>,
    /// First register-thread candidate seen as a branch target (code offset).
    pub register_thread: Option<u32>,
    /// Protected call sites visited, classified or not.
    pub call_sites: usize,
}

impl Classification {
    pub fn records(&self, category: Category) -> &BTreeMap<u32, Vec<ProtectedRecord>> {
        match category {
            Category::Constant => &self.constant,
            Category::StolenV1 => &self.stolen_v1,
            Category::StolenV2 => &self.stolen_v2,
            Category::StolenV3 => &self.stolen_v3,
        }
    }

    fn records_mut(&mut self, category: Category) -> &mut BTreeMap<u32, Vec<ProtectedRecord>> {
        match category {
            Category::Constant => &mut self.constant,
            Category::StolenV1 => &mut self.stolen_v1,
            Category::StolenV2 => &mut self.stolen_v2,
            Category::StolenV3 => &mut self.stolen_v3,
        }
    }

    fn insert(&mut self, category: Category, function: u32, record: ProtectedRecord) {
        trace!(
            category = category.name(),
            function = format_args!("0x{:08x}", function),
            eip = format_args!("0x{:08x}", record.eip),
            bp = format_args!("0x{:08x}", record.bp),
            "classified call site"
        );
        self.records_mut(category)
            .entry(function)
            .or_default()
            .push(record);
    }

    /// Drop every StolenV2 key that was also classified as anything else.
    ///
    /// Returns the number of keys removed.
    pub fn reconcile(&mut self) -> usize {
        let shadowed: HashSet<u32> = self
            .constant
            .keys()
            .chain(self.stolen_v1.keys())
            .chain(self.stolen_v3.keys())
            .copied()
            .collect();
        let before = self.stolen_v2.len();
        self.stolen_v2.retain(|function, _| !shadowed.contains(function));
        before - self.stolen_v2.len()
    }

    /// Distinct protected functions in a category.
    pub fn unique_functions(&self, category: Category) -> usize {
        self.records(category).len()
    }

    pub fn is_empty(&self) -> bool {
        Category::ALL.iter().all(|c| self.records(*c).is_empty())
    }

    /// Flatten into catalog entries: Constant, V1, V2, V3, each in key order.
    pub fn entries(&self) -> Vec<CatalogEntry> {
        Category::ALL
            .iter()
            .flat_map(|&category| {
                self.records(category).iter().flat_map(move |(&function, records)| {
                    records.iter().map(move |r| CatalogEntry {
                        function,
                        record: EntryRecord {
                            prologue: r.prologue,
                            eip: r.eip,
                            bp: r.bp,
                            value: UNRESOLVED,
                            category,
                        },
                    })
                })
            })
            .collect()
    }
}

/// Byte-walking classifier over a loaded image.
pub struct Classifier<'a> {
    image: &'a BinaryImage,
    /// Raw data of the first section through end of file.
    code: &'a [u8],
    finalize: Vec<(Pattern, u32)>,
    old_version: bool,
}

impl<'a> Classifier<'a> {
    pub fn new(image: &'a BinaryImage, signatures: &SignatureSet, old_version: bool) -> Self {
        let finalize = signatures
            .finalize
            .iter()
            .filter_map(|f| match Pattern::parse(&f.pattern) {
                Ok(p) => Some((p, f.offset)),
                Err(e) => {
                    debug!(error = %e, "skipping finalize signature");
                    None
                }
            })
            .collect();

        Self {
            image,
            code: image.code_tail(),
            finalize,
            old_version,
        }
    }

    /// Classify every branch into `protected` (code offsets).
    ///
    /// `register_thread` holds candidate code offsets; the first one reached by
    /// an instruction of interest is reported. `on_progress` receives the
    /// number of bytes walked so far.
    pub fn classify<F>(
        &self,
        protected: &HashSet<u32>,
        register_thread: &HashSet<u32>,
        mut on_progress: F,
    ) -> Classification
    where
        F: FnMut(usize, usize),
    {
        let mut result = Classification::default();
        let total = self.code.len();
        const PROGRESS_STEP: usize = 0x10000;

        for offset in 0..total {
            if offset % PROGRESS_STEP == 0 {
                on_progress(offset, total);
            }

            let Some(instr) = self.decode_at(offset) else {
                continue;
            };
            let Some(target) = self.branch_target(&instr) else {
                continue;
            };

            if result.register_thread.is_none() && register_thread.contains(&target) {
                debug!(
                    target = format_args!("0x{:08x}", self.image.code_va(target)),
                    "register-thread function referenced"
                );
                result.register_thread = Some(target);
            }

            if protected.contains(&target) {
                result.call_sites += 1;
                self.classify_site(&mut result, offset, target as usize);
            }
        }

        on_progress(total, total);
        result
    }

    fn decode_at(&self, offset: usize) -> Option<Instruction> {
        let end = offset.checked_add(MAX_INSTRUCTION_LEN)?.min(self.code.len());
        let bytes = self.code.get(offset..end)?;
        let ip = self.image.code_va(offset as u32) as u64;
        let mut decoder = Decoder::with_ip(32, bytes, ip, DecoderOptions::NONE);
        let instr = decoder.decode();
        (!instr.is_invalid()).then_some(instr)
    }

    /// Code offset a `call`/`jmp`/`mov eax, imm32` refers to.
    fn branch_target(&self, instr: &Instruction) -> Option<u32> {
        match instr.mnemonic() {
            Mnemonic::Call | Mnemonic::Jmp if instr.op0_kind() == OpKind::NearBranch32 => Some(
                instr
                    .near_branch32()
                    .wrapping_sub(self.image.code_base),
            ),
            Mnemonic::Mov
                if instr.op0_kind() == OpKind::Register
                    && instr.op0_register() == Register::EAX
                    && instr.op1_kind() == OpKind::Immediate32 =>
            {
                self.image.va_to_code_offset(instr.immediate32())
            }
            _ => None,
        }
    }

    fn byte(&self, offset: usize) -> Option<u8> {
        self.code.get(offset).copied()
    }

    fn pair(&self, offset: usize) -> Option<[u8; 2]> {
        let bytes = self.code.get(offset..offset.checked_add(2)?)?;
        Some([bytes[0], bytes[1]])
    }

    fn va(&self, offset: usize) -> u32 {
        self.image.code_va(offset as u32)
    }

    /// Breakpoint code offset from the first finalize epilogue after `target`.
    fn finalize_anchor(&self, target: usize) -> Option<usize> {
        let window = scanner::region(self.code, target, SCAN_WINDOW);
        self.finalize.iter().find_map(|(pattern, bp_offset)| {
            pattern
                .find(window)
                .map(|found| target + found + *bp_offset as usize)
        })
    }

    fn classify_site(&self, result: &mut Classification, site: usize, target: usize) {
        let function = self.va(target);
        let next = site + CALL_LEN;

        if let Some(bp) = self.finalize_anchor(target) {
            let eip = self.va(site);
            let bp = self.va(bp);
            let record = |prologue| ProtectedRecord { prologue, eip, bp };

            if self.old_version {
                match self.pair(next) {
                    Some(CALL_EAX) => {
                        let eip = self.v1_eip(site);
                        result.insert(
                            Category::StolenV1,
                            function,
                            ProtectedRecord {
                                prologue: function,
                                eip,
                                bp,
                            },
                        );
                    }
                    Some(JMP_EAX) => result.insert(Category::StolenV2, function, record(function)),
                    _ => {}
                }
                return;
            }

            if matches!(self.byte(next), Some(OP_RET) | Some(OP_MOV_RM)) {
                result.insert(Category::Constant, function, record(function));
            } else if self.pair(next) == Some(JMP_EAX) {
                result.insert(Category::StolenV2, function, record(function));
            } else if self.byte(site) == Some(OP_JMP_SHORT) {
                result.insert(Category::Constant, function, record(function));
            } else {
                let prologue = self
                    .find_prologue(site)
                    .map(|offset| self.va(offset))
                    .unwrap_or(function);
                result.insert(Category::StolenV3, function, record(prologue));
            }
        } else if self.old_version && self.pair(next) == Some(CALL_EAX) {
            // No epilogue to anchor on: break right after `call eax`.
            let record = ProtectedRecord {
                prologue: function,
                eip: self.v1_eip(site),
                bp: self.va(next + CALL_EAX.len()),
            };
            result.insert(Category::StolenV1, function, record);
        }
    }

    /// Redirect EIP for `call eax` sites: include a preceding `push ecx`.
    fn v1_eip(&self, site: usize) -> u32 {
        match site.checked_sub(1) {
            Some(prev) if self.byte(prev) == Some(OP_PUSH_ECX) => self.va(prev),
            _ => self.va(site),
        }
    }

    /// Nearest `push ebp; mov ebp, esp` at or before `site`, within the scan window.
    fn find_prologue(&self, site: usize) -> Option<usize> {
        let floor = site.saturating_sub(SCAN_WINDOW);
        ((floor + 1)..=site).rev().find(|&offset| {
            let Some(push) = self.decode_at(offset) else {
                return false;
            };
            if push.mnemonic() != Mnemonic::Push
                || push.op0_kind() != OpKind::Register
                || push.op0_register() != Register::EBP
            {
                return false;
            }
            self.decode_at(offset + push.len()).is_some_and(|mov| {
                mov.mnemonic() == Mnemonic::Mov
                    && mov.op0_kind() == OpKind::Register
                    && mov.op1_kind() == OpKind::Register
                    && mov.op0_register() == Register::EBP
                    && mov.op1_register() == Register::ESP
            })
        })
    }
}
