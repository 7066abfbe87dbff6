//! PE image loading for CEG analysis.
//!
//! The analyzer works on the on-disk file image, not a mapped module, so every
//! header read is bounds-checked against the file buffer. Three coordinate
//! systems meet here:
//!
//! - **code offset**: position relative to the first section's raw data
//! - **virtual address**: where the code runs inside the target process
//! - **file offset**: position inside the file on disk

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{Error, Result};

pub const DOS_MAGIC: u16 = 0x5A4D;
pub const PE_SIGNATURE: u32 = 0x0000_4550;
pub const MACHINE_I386: u16 = 0x014C;

/// `IMAGE_DLLCHARACTERISTICS_DYNAMIC_BASE`.
pub const DLLCHARACTERISTICS_DYNAMIC_BASE: u16 = 0x0040;

/// File offset of `e_lfanew` in the DOS header.
const DOS_LFANEW: usize = 0x3C;

// Fields of the PE32 optional header, relative to its start.
const OPT_IMAGE_BASE: usize = 0x1C;
const OPT_DLL_CHARACTERISTICS: usize = 0x46;

/// COFF file header, which follows the `PE\0\0` signature.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug)]
pub struct FileHeader {
    pub machine: u16,
    pub section_count: u16,
    pub timestamp: u32,
    pub symbol_table: u32,
    pub symbol_count: u32,
    pub optional_header_size: u16,
    pub characteristics: u16,
}

/// One entry of the section table.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug)]
pub struct SectionHeader {
    pub name: [u8; 8],
    pub virtual_size: u32,
    pub virtual_address: u32,
    pub raw_size: u32,
    pub raw_offset: u32,
    /// Relocation and line-number fields, unused for images.
    pub coff: [u8; 12],
    pub characteristics: u32,
}

/// A section as the analyzer sees it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SectionInfo {
    pub name: String,
    pub virtual_address: u32,
    pub virtual_size: u32,
    pub raw_offset: u32,
    pub raw_size: u32,
}

impl From<&SectionHeader> for SectionInfo {
    fn from(header: &SectionHeader) -> Self {
        let len = header.name.iter().position(|&b| b == 0).unwrap_or(8);
        Self {
            name: String::from_utf8_lossy(&header.name[..len]).into_owned(),
            virtual_address: header.virtual_address,
            virtual_size: header.virtual_size,
            raw_offset: header.raw_offset,
            raw_size: header.raw_size,
        }
    }
}

/// Copy a plain-old-data value out of `data` at `offset`.
fn read_at<T: Copy>(data: &[u8], offset: usize) -> Result<T> {
    let size = std::mem::size_of::<T>();
    match offset.checked_add(size) {
        Some(end) if end <= data.len() => {
            // SAFETY: `offset..end` is inside `data` and T is plain data.
            Ok(unsafe { std::ptr::read_unaligned(data.as_ptr().add(offset) as *const T) })
        }
        _ => Err(Error::HeadersTooSmall {
            expected: offset.saturating_add(size),
            actual: data.len(),
        }),
    }
}

/// Validated PE32 headers of an on-disk image.
#[derive(Clone, Debug)]
pub struct PeHeaders {
    /// `e_lfanew`.
    pub pe_offset: u32,
    pub machine: u16,
    /// Preferred image base.
    pub image_base: u32,
    pub dll_characteristics: u16,
    /// File offset of `DllCharacteristics`, for rewriting the ASLR bit.
    pub dll_characteristics_offset: usize,
    pub sections: Vec<SectionInfo>,
}

impl PeHeaders {
    /// Parse and validate the DOS, NT and section headers of a 32-bit image.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::EmptyImage);
        }
        if read_at::<u16>(data, 0)? != DOS_MAGIC {
            return Err(Error::InvalidDosSignature(0));
        }

        let pe_offset = read_at::<u32>(data, DOS_LFANEW)?;
        let nt = pe_offset as usize;
        if read_at::<u32>(data, nt)? != PE_SIGNATURE {
            return Err(Error::InvalidPeSignature(nt));
        }

        let file: FileHeader = read_at(data, nt + 4)?;
        let machine = file.machine;
        if machine != MACHINE_I386 {
            return Err(Error::UnsupportedMachine(machine));
        }

        let optional = nt + 4 + std::mem::size_of::<FileHeader>();
        let image_base = read_at::<u32>(data, optional + OPT_IMAGE_BASE)?;
        let dll_characteristics_offset = optional + OPT_DLL_CHARACTERISTICS;
        let dll_characteristics = read_at::<u16>(data, dll_characteristics_offset)?;

        let table = optional + file.optional_header_size as usize;
        let sections = (0..file.section_count as usize)
            .map(|i| {
                read_at::<SectionHeader>(data, table + i * std::mem::size_of::<SectionHeader>())
                    .map(|h| SectionInfo::from(&h))
            })
            .collect::<Result<Vec<_>>>()?;
        debug!(sections = sections.len(), "parsed section table");

        Ok(Self {
            pe_offset,
            machine,
            image_base,
            dll_characteristics,
            dll_characteristics_offset,
            sections,
        })
    }

    /// Convert an RVA to a file offset through the section table.
    pub fn rva_to_offset(&self, rva: u32) -> Option<u32> {
        self.sections
            .iter()
            .find(|s| {
                rva >= s.virtual_address
                    && (rva as u64) < s.virtual_address as u64 + s.virtual_size as u64
            })
            .map(|s| rva - s.virtual_address + s.raw_offset)
    }

    /// Whether the image opts into ASLR.
    pub fn aslr_enabled(&self) -> bool {
        self.dll_characteristics & DLLCHARACTERISTICS_DYNAMIC_BASE != 0
    }
}

/// A CEG-protected executable loaded from disk, with its code-section geometry.
#[derive(Clone, Debug)]
pub struct BinaryImage {
    data: Vec<u8>,
    /// Validated headers.
    pub headers: PeHeaders,
    /// Raw `ImageBase` from the optional header.
    pub image_base: u32,
    /// Virtual address (RVA) of the first section.
    pub section_va: u32,
    /// File offset of the first section's raw data.
    pub section_raw: u32,
    /// Virtual size of the first section.
    pub code_size: u32,
    /// `image_base + section_va`: where code offset 0 runs.
    pub code_base: u32,
    /// Whether the source image had the dynamic-base flag set.
    pub aslr_enabled: bool,
}

impl BinaryImage {
    /// Read and validate an image from disk.
    pub fn read(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        debug!(path = %path.display(), size = data.len(), "read binary");
        Self::parse(data)
    }

    /// Validate an in-memory file image and derive its code geometry.
    ///
    /// The dynamic-base flag is cleared in the owned buffer when present, so
    /// [`BinaryImage::save_without_aslr`] writes the fixed-base variant.
    pub fn parse(data: Vec<u8>) -> Result<Self> {
        let headers = PeHeaders::parse(&data)?;

        if headers.image_base == 0 {
            return Err(Error::NullImageBase);
        }

        let first = headers.sections.first().ok_or(Error::NoSections)?;
        if first.raw_offset == 0 {
            return Err(Error::NullRawPointer);
        }
        if first.virtual_size == 0 {
            return Err(Error::NullVirtualSize);
        }

        let image_base = headers.image_base;
        let section_va = first.virtual_address;
        let section_raw = first.raw_offset;
        let code_size = first.virtual_size;
        let aslr_enabled = headers.aslr_enabled();

        let mut image = Self {
            data,
            image_base,
            section_va,
            section_raw,
            code_size,
            code_base: image_base.wrapping_add(section_va),
            aslr_enabled,
            headers,
        };

        if image.aslr_enabled {
            image.disable_aslr();
            info!("disabled ASLR in the working copy");
        }

        Ok(image)
    }

    /// The whole file buffer.
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// The first section's code span, clamped to the file.
    pub fn code(&self) -> &[u8] {
        let start = (self.section_raw as usize).min(self.data.len());
        let end = start
            .saturating_add(self.code_size as usize)
            .min(self.data.len());
        &self.data[start..end]
    }

    /// Everything from the first section's raw data to end of file.
    pub fn code_tail(&self) -> &[u8] {
        let start = (self.section_raw as usize).min(self.data.len());
        &self.data[start..]
    }

    /// Virtual address of a code offset.
    #[inline]
    pub fn code_va(&self, code_offset: u32) -> u32 {
        self.code_base.wrapping_add(code_offset)
    }

    /// Convert a virtual address to a file offset.
    #[inline]
    pub fn va_to_file_offset(&self, va: u32) -> Option<u32> {
        va.checked_sub(self.image_base)?
            .checked_sub(self.section_va)?
            .checked_add(self.section_raw)
    }

    /// Convert a virtual address to a code offset.
    #[inline]
    pub fn va_to_code_offset(&self, va: u32) -> Option<u32> {
        self.va_to_file_offset(va)?.checked_sub(self.section_raw)
    }

    /// Clear the dynamic-base flag in the owned buffer.
    pub fn disable_aslr(&mut self) {
        let offset = self.headers.dll_characteristics_offset;
        let cleared = self.headers.dll_characteristics & !DLLCHARACTERISTICS_DYNAMIC_BASE;
        self.data[offset..offset + 2].copy_from_slice(&cleared.to_le_bytes());
        self.headers.dll_characteristics = cleared;
    }

    /// Path of the `_noaslr` sibling for `source`.
    pub fn no_aslr_path(source: &Path) -> PathBuf {
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let name = match source.extension() {
            Some(ext) => format!("{}_noaslr.{}", stem, ext.to_string_lossy()),
            None => format!("{}_noaslr", stem),
        };
        source.with_file_name(name)
    }

    /// Write the (ASLR-cleared) buffer next to `source` as `<stem>_noaslr<ext>`.
    pub fn save_without_aslr(&self, source: &Path) -> Result<PathBuf> {
        if self.data.is_empty() {
            return Err(Error::EmptyImage);
        }
        let path = Self::no_aslr_path(source);
        std::fs::write(&path, &self.data)?;
        Ok(path)
    }
}

/// Synthetic images for unit tests.
#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub const IMAGE_BASE: u32 = 0x0040_0000;
    pub const TEXT_RVA: u32 = 0x1000;
    pub const TEXT_RAW: usize = 0x400;

    /// PE32 with one `.text` section holding `code` at file offset 0x400.
    pub fn image_with_code(code: &[u8], dll_characteristics: u16) -> Vec<u8> {
        let mut data = vec![0u8; TEXT_RAW + code.len().max(1)];
        data[0..2].copy_from_slice(&DOS_MAGIC.to_le_bytes());
        data[0x3C..0x40].copy_from_slice(&0x80u32.to_le_bytes());
        data[0x80..0x84].copy_from_slice(&PE_SIGNATURE.to_le_bytes());
        data[0x84..0x86].copy_from_slice(&MACHINE_I386.to_le_bytes());
        data[0x86..0x88].copy_from_slice(&1u16.to_le_bytes());
        data[0x94..0x96].copy_from_slice(&0xE0u16.to_le_bytes());
        let opt = 0x98;
        data[opt..opt + 2].copy_from_slice(&0x10Bu16.to_le_bytes());
        data[opt + 28..opt + 32].copy_from_slice(&IMAGE_BASE.to_le_bytes());
        data[opt + 70..opt + 72].copy_from_slice(&dll_characteristics.to_le_bytes());
        let sec = opt + 0xE0;
        let size = code.len().max(1) as u32;
        data[sec..sec + 5].copy_from_slice(b".text");
        data[sec + 8..sec + 12].copy_from_slice(&size.to_le_bytes());
        data[sec + 12..sec + 16].copy_from_slice(&TEXT_RVA.to_le_bytes());
        data[sec + 16..sec + 20].copy_from_slice(&size.to_le_bytes());
        data[sec + 20..sec + 24].copy_from_slice(&(TEXT_RAW as u32).to_le_bytes());
        data[TEXT_RAW..TEXT_RAW + code.len()].copy_from_slice(code);
        data
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::image_with_code;
    use super::*;

    /// 0x200 bytes of code at RVA 0x1000, raw 0x400.
    fn sample_image(dll_characteristics: u16) -> Vec<u8> {
        image_with_code(&[0xCC; 0x200], dll_characteristics)
    }

    #[test]
    fn test_header_layouts() {
        assert_eq!(std::mem::size_of::<FileHeader>(), 20);
        assert_eq!(std::mem::size_of::<SectionHeader>(), 40);
    }

    #[test]
    fn test_section_table() {
        let headers = PeHeaders::parse(&sample_image(0)).unwrap();
        assert_eq!(
            headers.sections,
            vec![SectionInfo {
                name: ".text".into(),
                virtual_address: 0x1000,
                virtual_size: 0x200,
                raw_offset: 0x400,
                raw_size: 0x200,
            }]
        );
        assert_eq!(headers.dll_characteristics_offset, 0x98 + 0x46);
    }

    #[test]
    fn test_truncated_headers() {
        let data = sample_image(0)[..0x90].to_vec();
        assert!(matches!(
            PeHeaders::parse(&data),
            Err(Error::HeadersTooSmall { .. })
        ));
    }

    #[test]
    fn test_code_geometry() {
        let image = BinaryImage::parse(sample_image(0)).unwrap();
        assert_eq!(image.image_base, 0x0040_0000);
        assert_eq!(image.code_base, 0x0040_1000);
        assert_eq!(image.code().len(), 0x200);
        assert_eq!(image.code_va(0x10), 0x0040_1010);
        assert_eq!(image.va_to_file_offset(0x0040_1010), Some(0x410));
        assert_eq!(image.va_to_code_offset(0x0040_1010), Some(0x10));
        assert_eq!(image.va_to_code_offset(0x0010_0000), None);
        assert!(!image.aslr_enabled);
    }

    #[test]
    fn test_aslr_cleared_in_buffer() {
        let image = BinaryImage::parse(sample_image(0x0140)).unwrap();
        assert!(image.aslr_enabled);
        let reparsed = PeHeaders::parse(image.bytes()).unwrap();
        assert!(!reparsed.aslr_enabled());
        assert_eq!(reparsed.dll_characteristics, 0x0100);
    }

    #[test]
    fn test_rejects_bad_signatures() {
        let mut data = sample_image(0);
        data[0] = 0;
        assert!(matches!(BinaryImage::parse(data), Err(Error::InvalidDosSignature(0))));

        let mut data = sample_image(0);
        data[0x80] = 0;
        assert!(matches!(BinaryImage::parse(data), Err(Error::InvalidPeSignature(0x80))));
    }

    #[test]
    fn test_rejects_zero_fields() {
        let mut data = sample_image(0);
        data[0x98 + 28..0x98 + 32].fill(0);
        assert!(matches!(BinaryImage::parse(data), Err(Error::NullImageBase)));

        let mut data = sample_image(0);
        let sec = 0x98 + 0xE0;
        data[sec + 20..sec + 24].fill(0);
        assert!(matches!(BinaryImage::parse(data), Err(Error::NullRawPointer)));

        let mut data = sample_image(0);
        data[sec + 8..sec + 12].fill(0);
        assert!(matches!(BinaryImage::parse(data), Err(Error::NullVirtualSize)));
    }

    #[test]
    fn test_rva_to_offset() {
        let headers = PeHeaders::parse(&sample_image(0)).unwrap();
        assert_eq!(headers.rva_to_offset(0x1000), Some(0x400));
        assert_eq!(headers.rva_to_offset(0x11FF), Some(0x5FF));
        assert_eq!(headers.rva_to_offset(0x1200), None);
    }

    #[test]
    fn test_no_aslr_path() {
        let path = BinaryImage::no_aslr_path(Path::new("/games/app.exe"));
        assert_eq!(path, Path::new("/games/app_noaslr.exe"));
    }
}
