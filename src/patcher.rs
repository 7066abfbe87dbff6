//! Catalog-driven patching of the on-disk executable.
//!
//! Every patch overwrites the start of a protected function:
//!
//! ```text
//! ReturnTrue       B0 01 C3            mov al, 1; ret
//! ReturnValue(v)   B8 vv vv vv vv C3   mov eax, v; ret
//! JumpTo(d)        E9 rr rr rr rr      jmp d   (rel = d - (prologue + 5))
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::catalog::{Catalog, CatalogSlot, Category, UNRESOLVED};
use crate::error::Result;
use crate::pe::PeHeaders;

/// Bytes written at a patched function.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PatchKind {
    /// Catalog type 0: init, terminate, integrity and test-secret functions.
    ReturnTrue,
    /// Catalog types 1 to 3.
    ReturnValue(u32),
    /// Catalog type 4: jump to the captured destination.
    JumpTo(u32),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Patch {
    /// Virtual address of the first patched byte.
    pub prologue: u32,
    pub kind: PatchKind,
}

impl Patch {
    /// Encoded replacement bytes.
    pub fn bytes(&self) -> Vec<u8> {
        match self.kind {
            PatchKind::ReturnTrue => vec![0xB0, 0x01, 0xC3],
            PatchKind::ReturnValue(value) => {
                let mut bytes = Vec::with_capacity(6);
                bytes.push(0xB8);
                bytes.extend_from_slice(&value.to_le_bytes());
                bytes.push(0xC3);
                bytes
            }
            PatchKind::JumpTo(dest) => {
                let rel = dest.wrapping_sub(self.prologue.wrapping_add(5));
                let mut bytes = Vec::with_capacity(5);
                bytes.push(0xE9);
                bytes.extend_from_slice(&rel.to_le_bytes());
                bytes
            }
        }
    }
}

/// Patches keyed by address; the first patch registered for an address wins.
#[derive(Clone, Debug, Default)]
pub struct PatchSet {
    patches: BTreeMap<u32, Patch>,
}

impl PatchSet {
    fn add(&mut self, key: u32, patch: Patch) {
        self.patches.entry(key).or_insert(patch);
    }

    /// Collect patches: anchors, typed entries, then test-secret and integrity.
    pub fn from_catalog(catalog: &Catalog) -> Self {
        let mut set = Self::default();
        let return_true = |prologue| Patch {
            prologue,
            kind: PatchKind::ReturnTrue,
        };

        if catalog.init != 0 {
            set.add(catalog.init, return_true(catalog.init));
        }
        if catalog.terminate != 0 {
            set.add(catalog.terminate, return_true(catalog.terminate));
        }

        for (index, slot) in catalog.entries.iter().enumerate() {
            let entry = match slot {
                CatalogSlot::Entry(entry) => entry,
                CatalogSlot::Malformed(_) => {
                    match slot.return_true_site() {
                        Some((function, prologue)) => set.add(function, return_true(prologue)),
                        None => warn!(index, "skipping malformed catalog entry"),
                    }
                    continue;
                }
            };
            let record = &entry.record;
            if record.value == UNRESOLVED {
                warn!(
                    function = format_args!("0x{:08x}", entry.function),
                    "entry has no captured value"
                );
            }
            let kind = match record.category {
                Category::Constant | Category::StolenV1 | Category::StolenV2 => {
                    PatchKind::ReturnValue(record.value)
                }
                Category::StolenV3 => PatchKind::JumpTo(record.value),
            };
            set.add(
                entry.function,
                Patch {
                    prologue: record.prologue,
                    kind,
                },
            );
        }

        for &address in catalog.test_secret.iter().chain(&catalog.integrity) {
            set.add(address, return_true(address));
        }

        debug!(patches = set.len(), "collected patches");
        set
    }

    pub fn len(&self) -> usize {
        self.patches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Patch> {
        self.patches.values()
    }
}

/// Counts from one patching pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PatchStats {
    pub applied: usize,
    pub skipped: usize,
}

/// A PE file buffer being patched.
pub struct Patcher {
    data: Vec<u8>,
    headers: PeHeaders,
}

impl Patcher {
    /// Validate the file's DOS and NT headers.
    pub fn new(data: Vec<u8>) -> Result<Self> {
        let headers = PeHeaders::parse(&data)?;
        Ok(Self { data, headers })
    }

    pub fn read(path: &Path) -> Result<Self> {
        Self::new(std::fs::read(path)?)
    }

    pub fn image_base(&self) -> u32 {
        self.headers.image_base
    }

    /// File offset for a virtual address, if it is safely patchable.
    fn patch_offset(&self, prologue: u32) -> Option<usize> {
        let rva = prologue.checked_sub(self.headers.image_base)?;
        let offset = self.headers.rva_to_offset(rva)? as usize;
        if offset == 0 || offset >= self.data.len().saturating_sub(5) {
            return None;
        }
        Some(offset)
    }

    /// Apply every patch that maps into the file.
    pub fn apply(&mut self, patches: &PatchSet) -> PatchStats {
        let mut stats = PatchStats::default();

        for patch in patches.iter() {
            let Some(offset) = self.patch_offset(patch.prologue) else {
                debug!(
                    prologue = format_args!("0x{:08x}", patch.prologue),
                    "patch target outside the file"
                );
                stats.skipped += 1;
                continue;
            };

            let bytes = patch.bytes();
            let end = (offset + bytes.len()).min(self.data.len());
            let len = end - offset;
            self.data[offset..end].copy_from_slice(&bytes[..len]);
            stats.applied += 1;
        }

        info!(applied = stats.applied, skipped = stats.skipped, "applied patches");
        stats
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// `<stem>_noceg<ext>` next to `source`.
    pub fn output_path(source: &Path) -> PathBuf {
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let name = match source.extension() {
            Some(ext) => format!("{}_noceg.{}", stem, ext.to_string_lossy()),
            None => format!("{}_noceg", stem),
        };
        source.with_file_name(name)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, &self.data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogEntry, CegVersion, EntryRecord};
    use crate::pe::test_support::{image_with_code, TEXT_RAW};

    fn catalog(entries: Vec<CatalogSlot>) -> Catalog {
        Catalog {
            init: 0x0040_1000,
            register_thread: 0,
            terminate: 0,
            version: CegVersion::New,
            entries,
            should_restart: false,
            integrity: vec![],
            test_secret: vec![],
        }
    }

    fn typed(function: u32, prologue: u32, value: u32, category: Category) -> CatalogSlot {
        CatalogSlot::Entry(CatalogEntry {
            function,
            record: EntryRecord {
                prologue,
                eip: 0,
                bp: 0,
                value,
                category,
            },
        })
    }

    #[test]
    fn test_patch_encodings() {
        let ret = Patch {
            prologue: 0x0040_1000,
            kind: PatchKind::ReturnTrue,
        };
        assert_eq!(ret.bytes(), vec![0xB0, 0x01, 0xC3]);

        let value = Patch {
            prologue: 0x0040_1000,
            kind: PatchKind::ReturnValue(0x2A),
        };
        assert_eq!(value.bytes(), vec![0xB8, 0x2A, 0, 0, 0, 0xC3]);

        let jump = Patch {
            prologue: 0x0040_1000,
            kind: PatchKind::JumpTo(0x0040_1105),
        };
        assert_eq!(jump.bytes(), vec![0xE9, 0x00, 0x01, 0, 0]);

        let back = Patch {
            prologue: 0x0040_1000,
            kind: PatchKind::JumpTo(0x0040_0000),
        };
        assert_eq!(back.bytes(), vec![0xE9, 0xFB, 0xEF, 0xFF, 0xFF]);
    }

    #[test]
    fn test_first_insertion_wins() {
        let mut cat = catalog(vec![
            typed(0x0040_1010, 0x0040_1010, 1, Category::Constant),
            typed(0x0040_1010, 0x0040_1020, 2, Category::StolenV3),
        ]);
        cat.integrity = vec![0x0040_1000];
        let set = PatchSet::from_catalog(&cat);
        let patches: Vec<_> = set.iter().copied().collect();
        assert_eq!(
            patches,
            vec![
                Patch {
                    prologue: 0x0040_1000,
                    kind: PatchKind::ReturnTrue
                },
                Patch {
                    prologue: 0x0040_1010,
                    kind: PatchKind::ReturnValue(1)
                },
            ]
        );
    }

    #[test]
    fn test_type_zero_entry_returns_true() {
        let cat = Catalog::from_json(
            r#"{
                "Init": "0x00000000",
                "RegisterThread": "0x00000000",
                "ConstantOrStolen": [
                    { "0x00401010": { "Prologue": "0x00401018", "EIP": "0x00000000",
                                      "BP": "0x00000000", "Value": "0x00000000", "Type": 0 } },
                    { "0x00401040": { "Type": 7 } }
                ]
            }"#,
        )
        .unwrap();
        assert!(matches!(cat.entries[0], CatalogSlot::Malformed(_)));

        let set = PatchSet::from_catalog(&cat);
        let patches: Vec<_> = set.iter().copied().collect();
        assert_eq!(
            patches,
            vec![Patch {
                prologue: 0x0040_1018,
                kind: PatchKind::ReturnTrue
            }]
        );

        let mut patcher = Patcher::new(image_with_code(&[0xCC; 0x100], 0)).unwrap();
        assert_eq!(patcher.apply(&set).applied, 1);
        assert_eq!(
            &patcher.bytes()[TEXT_RAW + 0x18..TEXT_RAW + 0x1B],
            &[0xB0, 0x01, 0xC3]
        );
    }

    #[test]
    fn test_skips_targets_outside_file() {
        let data = image_with_code(&[0xCC; 0x100], 0);
        let mut patcher = Patcher::new(data).unwrap();
        let cat = catalog(vec![
            typed(0x0030_0000, 0x0030_0000, 1, Category::Constant),
            typed(0x0040_10FE, 0x0040_10FE, 1, Category::Constant),
            typed(0x0040_1010, 0x0040_1010, 7, Category::StolenV1),
        ]);
        let stats = patcher.apply(&PatchSet::from_catalog(&cat));
        assert_eq!(stats, PatchStats { applied: 2, skipped: 2 });
        assert_eq!(
            &patcher.bytes()[TEXT_RAW + 0x10..TEXT_RAW + 0x16],
            &[0xB8, 7, 0, 0, 0, 0xC3]
        );
        assert_eq!(&patcher.bytes()[TEXT_RAW..TEXT_RAW + 3], &[0xB0, 0x01, 0xC3]);
    }

    #[test]
    fn test_output_path() {
        assert_eq!(
            Patcher::output_path(Path::new("/g/game.exe")),
            Path::new("/g/game_noceg.exe")
        );
    }
}
