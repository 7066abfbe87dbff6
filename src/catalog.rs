//! The catalog file shared by the classifier, the runtime resolver and the patcher.
//!
//! Layout (pretty JSON, 4-space indent):
//!
//! ```json
//! {
//!     "Init": "0x00401000",
//!     "RegisterThread": "0x00401100",
//!     "Terminate": "0x00401200",
//!     "Version": 2,
//!     "ConstantOrStolen": [
//!         { "0x00402000": { "Prologue": "0x00402000", "EIP": "0x00403010",
//!                           "BP": "0x00402040", "Value": "0x00000000", "Type": 1 } }
//!     ],
//!     "ShouldRestart": false,
//!     "Integrity": ["0x00404000"],
//!     "TestSecret": []
//! }
//! ```
//!
//! The resolver only writes `Value`, through [`Catalog::update_value`].

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// `Value` of an entry that has not been captured yet.
pub const UNRESOLVED: u32 = 0;

/// Hex string helpers for catalog fields.
pub mod hex {
    use serde::{Deserialize, Deserializer};

    /// Parse `0x1234abcd`, `0X1234ABCD` or bare `1234abcd`.
    pub fn parse(text: &str) -> Option<u32> {
        let digits = text
            .strip_prefix("0x")
            .or_else(|| text.strip_prefix("0X"))
            .unwrap_or(text);
        if digits.is_empty() {
            return None;
        }
        u32::from_str_radix(digits, 16).ok()
    }

    /// Address form: lower-case, 8 digits.
    pub fn address(value: u32) -> String {
        format!("0x{:08x}", value)
    }

    /// Captured-value form: upper-case, 8 digits.
    pub fn value(value: u32) -> String {
        format!("0x{:08X}", value)
    }

    fn deserialize_u32<'de, D>(deserializer: D) -> Result<u32, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).ok_or_else(|| serde::de::Error::custom(format!("invalid hex value '{}'", s)))
    }

    pub mod lower {
        use serde::{Deserializer, Serializer};

        pub fn serialize<S>(value: &u32, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            serializer.serialize_str(&super::address(*value))
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<u32, D::Error>
        where
            D: Deserializer<'de>,
        {
            super::deserialize_u32(deserializer)
        }
    }

    pub mod upper {
        use serde::{Deserializer, Serializer};

        pub fn serialize<S>(value: &u32, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            serializer.serialize_str(&super::value(*value))
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<u32, D::Error>
        where
            D: Deserializer<'de>,
        {
            super::deserialize_u32(deserializer)
        }
    }

    pub mod list {
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S>(values: &[u32], serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            serializer.collect_seq(values.iter().map(|v| super::address(*v)))
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u32>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Vec::<String>::deserialize(deserializer)?
                .iter()
                .map(|s| {
                    super::parse(s).ok_or_else(|| {
                        serde::de::Error::custom(format!("invalid hex value '{}'", s))
                    })
                })
                .collect()
        }
    }
}

/// Protected-call category, stored as `Type` 1..=4.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Category {
    /// Always returns the same runtime value.
    Constant = 1,
    /// Old-style call through a register (`call eax`).
    StolenV1 = 2,
    /// Jump through a register (`jmp eax`).
    StolenV2 = 3,
    /// Relocated prologue; patched with a jump to the captured address.
    StolenV3 = 4,
}

impl Category {
    pub const ALL: [Category; 4] = [
        Category::Constant,
        Category::StolenV1,
        Category::StolenV2,
        Category::StolenV3,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Category::Constant => "constant",
            Category::StolenV1 => "stolen (v1)",
            Category::StolenV2 => "stolen (v2)",
            Category::StolenV3 => "stolen (v3)",
        }
    }
}

impl TryFrom<u8> for Category {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Category::Constant),
            2 => Ok(Category::StolenV1),
            3 => Ok(Category::StolenV2),
            4 => Ok(Category::StolenV3),
            other => Err(format!("unknown entry type {}", other)),
        }
    }
}

impl From<Category> for u8 {
    fn from(category: Category) -> Self {
        category as u8
    }
}

/// CEG generation, stored as `Version` 1 (old) or 2 (new).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum CegVersion {
    Old = 1,
    #[default]
    New = 2,
}

impl TryFrom<u8> for CegVersion {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(CegVersion::Old),
            2 => Ok(CegVersion::New),
            other => Err(format!("unknown CEG version {}", other)),
        }
    }
}

impl From<CegVersion> for u8 {
    fn from(version: CegVersion) -> Self {
        version as u8
    }
}

/// Per-call-site data stored under a protected function address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryRecord {
    /// Patch target.
    #[serde(rename = "Prologue", with = "hex::lower")]
    pub prologue: u32,
    /// Where execution is redirected to enter the protected path.
    #[serde(rename = "EIP", with = "hex::lower")]
    pub eip: u32,
    /// Where the result is captured.
    #[serde(rename = "BP", with = "hex::lower")]
    pub bp: u32,
    #[serde(rename = "Value", with = "hex::upper")]
    pub value: u32,
    #[serde(rename = "Type")]
    pub category: Category,
}

/// One `{ "0xaddr": { ... } }` element of `ConstantOrStolen`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    try_from = "BTreeMap<String, EntryRecord>",
    into = "BTreeMap<String, EntryRecord>"
)]
pub struct CatalogEntry {
    pub function: u32,
    pub record: EntryRecord,
}

impl CatalogEntry {
    pub fn is_resolved(&self) -> bool {
        self.record.value != UNRESOLVED
    }
}

impl TryFrom<BTreeMap<String, EntryRecord>> for CatalogEntry {
    type Error = String;

    fn try_from(map: BTreeMap<String, EntryRecord>) -> std::result::Result<Self, Self::Error> {
        if map.len() != 1 {
            return Err(format!("expected one function per element, got {}", map.len()));
        }
        let (key, record) = map
            .into_iter()
            .next()
            .ok_or_else(|| "empty element".to_string())?;
        let function = hex::parse(&key).ok_or_else(|| format!("invalid function key '{}'", key))?;
        Ok(Self { function, record })
    }
}

impl From<CatalogEntry> for BTreeMap<String, EntryRecord> {
    fn from(entry: CatalogEntry) -> Self {
        BTreeMap::from([(hex::address(entry.function), entry.record)])
    }
}

/// A `ConstantOrStolen` element: typed when well-formed, kept verbatim otherwise.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CatalogSlot {
    Entry(CatalogEntry),
    Malformed(serde_json::Value),
}

impl CatalogSlot {
    pub fn entry(&self) -> Option<&CatalogEntry> {
        match self {
            CatalogSlot::Entry(e) => Some(e),
            CatalogSlot::Malformed(_) => None,
        }
    }

    /// `(function, prologue)` of a `Type` 0 element.
    ///
    /// Type 0 is not a resolvable category, so such elements decode as
    /// [`CatalogSlot::Malformed`]; the patcher still turns them into
    /// `mov al, 1; ret`.
    pub fn return_true_site(&self) -> Option<(u32, u32)> {
        let CatalogSlot::Malformed(value) = self else {
            return None;
        };
        let object = value.as_object().filter(|o| o.len() == 1)?;
        let (key, record) = object.iter().next()?;
        if record.get("Type")?.as_u64()? != 0 {
            return None;
        }
        let function = hex::parse(key)?;
        let prologue = match record.get("Prologue") {
            Some(text) => hex::parse(text.as_str()?)?,
            None => function,
        };
        Some((function, prologue))
    }
}

/// The persisted catalog.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(rename = "Init", with = "hex::lower")]
    pub init: u32,
    #[serde(rename = "RegisterThread", with = "hex::lower")]
    pub register_thread: u32,
    #[serde(rename = "Terminate", with = "hex::lower", default)]
    pub terminate: u32,
    #[serde(rename = "Version", default)]
    pub version: CegVersion,
    #[serde(rename = "ConstantOrStolen", default)]
    pub entries: Vec<CatalogSlot>,
    #[serde(rename = "ShouldRestart", default)]
    pub should_restart: bool,
    #[serde(rename = "Integrity", with = "hex::list", default)]
    pub integrity: Vec<u32>,
    #[serde(rename = "TestSecret", with = "hex::list", default)]
    pub test_secret: Vec<u32>,
}

impl Catalog {
    /// Parse a catalog from JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Render as pretty JSON with 4-space indentation.
    pub fn to_json(&self) -> Result<String> {
        let mut out = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
        self.serialize(&mut serializer)?;
        String::from_utf8(out)
            .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))
    }

    /// Read a catalog file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let catalog = Self::from_json(&text)?;
        debug!(
            path = %path.display(),
            entries = catalog.entries.len(),
            "loaded catalog"
        );
        Ok(catalog)
    }

    /// Write the catalog file, replacing any existing content.
    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// Typed entry at `index`, if that slot is well-formed.
    pub fn entry(&self, index: usize) -> Option<&CatalogEntry> {
        self.entries.get(index).and_then(CatalogSlot::entry)
    }

    /// Iterate over well-formed entries with their slot index.
    pub fn typed_entries(&self) -> impl Iterator<Item = (usize, &CatalogEntry)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.entry().map(|e| (i, e)))
    }

    /// First slot at or after `from` that still needs a capture.
    ///
    /// Malformed slots are returned too, so the caller can report and skip them.
    pub fn first_unresolved(&self, from: usize) -> Option<usize> {
        self.entries
            .iter()
            .enumerate()
            .skip(from)
            .find(|(_, slot)| slot.entry().map_or(true, |e| !e.is_resolved()))
            .map(|(i, _)| i)
    }

    /// Store a captured value. Returns `false` if `index` is not a typed entry.
    pub fn update_value(&mut self, index: usize, value: u32) -> bool {
        match self.entries.get_mut(index) {
            Some(CatalogSlot::Entry(entry)) => {
                entry.record.value = value;
                true
            }
            _ => false,
        }
    }

    pub fn unresolved_count(&self) -> usize {
        self.typed_entries().filter(|(_, e)| !e.is_resolved()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(function: u32, category: Category) -> CatalogSlot {
        CatalogSlot::Entry(CatalogEntry {
            function,
            record: EntryRecord {
                prologue: function,
                eip: function + 0x10,
                bp: function + 0x20,
                value: UNRESOLVED,
                category,
            },
        })
    }

    fn sample() -> Catalog {
        Catalog {
            init: 0x0040_1000,
            register_thread: 0x0040_1100,
            terminate: 0x0040_1200,
            version: CegVersion::New,
            entries: vec![
                entry(0x0040_2000, Category::Constant),
                entry(0x0040_3000, Category::StolenV3),
            ],
            should_restart: false,
            integrity: vec![0x0040_4000],
            test_secret: vec![],
        }
    }

    #[test]
    fn test_hex_parse() {
        assert_eq!(hex::parse("0x0040ABCD"), Some(0x0040_ABCD));
        assert_eq!(hex::parse("0X0040abcd"), Some(0x0040_ABCD));
        assert_eq!(hex::parse("401000"), Some(0x0040_1000));
        assert_eq!(hex::parse("0x"), None);
        assert_eq!(hex::parse("0xZZ"), None);
    }

    #[test]
    fn test_field_formats() {
        let mut catalog = sample();
        catalog.update_value(0, 0x2A);
        let json = catalog.to_json().unwrap();
        assert!(json.contains("\"Init\": \"0x00401000\""));
        assert!(json.contains("\"0x00402000\": {"));
        assert!(json.contains("\"Value\": \"0x0000002A\""));
        assert!(json.contains("\"Value\": \"0x00000000\""));
        assert!(json.contains("\n    \"Init\""));
    }

    #[test]
    fn test_every_category_round_trips() {
        let mut catalog = Catalog {
            init: 0x0040_1000,
            register_thread: 0x0040_1100,
            terminate: 0x0040_1200,
            version: CegVersion::Old,
            entries: Category::ALL
                .iter()
                .enumerate()
                .map(|(i, &category)| entry(0x0040_2000 + 0x100 * i as u32, category))
                .collect(),
            should_restart: true,
            integrity: vec![0x0040_4000, 0x0040_4100],
            test_secret: vec![0x0040_5000],
        };
        catalog.update_value(1, 0xDEAD_BEEF);
        catalog.update_value(3, 0x0040_6010);

        let json = catalog.to_json().unwrap();
        assert!(json.contains("\"Value\": \"0x00000000\""));
        assert!(json.contains("\"Value\": \"0xDEADBEEF\""));
        assert!(json.contains("\"Version\": 1"));
        for ty in 1..=4 {
            assert!(json.contains(&format!("\"Type\": {}", ty)));
        }

        let again = Catalog::from_json(&json).unwrap();
        assert_eq!(again, catalog);
        let categories: Vec<_> = again.typed_entries().map(|(_, e)| e.record.category).collect();
        assert_eq!(categories, Category::ALL.to_vec());
        assert_eq!(again.unresolved_count(), 2);
        let v1 = again.entry(1).unwrap();
        assert_eq!(v1.function, 0x0040_2100);
        assert_eq!(v1.record.eip, 0x0040_2110);
        assert_eq!(v1.record.bp, 0x0040_2120);
        assert_eq!(v1.record.value, 0xDEAD_BEEF);
    }

    #[test]
    fn test_missing_init_is_rejected() {
        let err = Catalog::from_json(r#"{ "RegisterThread": "0x00401000" }"#).unwrap_err();
        assert!(err.to_string().contains("Init"));
    }

    #[test]
    fn test_optional_fields_default() {
        let catalog =
            Catalog::from_json(r#"{ "Init": "0x1", "RegisterThread": "0x0" }"#).unwrap();
        assert_eq!(catalog.version, CegVersion::New);
        assert!(catalog.entries.is_empty());
        assert!(!catalog.should_restart);
    }

    #[test]
    fn test_malformed_slot_survives_round_trip() {
        let text = r#"{
            "Init": "0x00401000",
            "RegisterThread": "0x00000000",
            "ConstantOrStolen": [
                { "0x00402000": { "Prologue": "0x00402000", "EIP": "0x00402010",
                                  "BP": "0x00402020", "Value": "0x00000000", "Type": 9 } },
                { "0x00403000": { "Prologue": "0x00403000", "EIP": "0x00403010",
                                  "BP": "0x00403020", "Value": "0x00000000", "Type": 1 } }
            ]
        }"#;
        let catalog = Catalog::from_json(text).unwrap();
        assert!(matches!(catalog.entries[0], CatalogSlot::Malformed(_)));
        assert_eq!(catalog.entry(1).map(|e| e.function), Some(0x0040_3000));

        let again = Catalog::from_json(&catalog.to_json().unwrap()).unwrap();
        assert_eq!(again, catalog);
    }

    #[test]
    fn test_first_unresolved_and_update() {
        let mut catalog = sample();
        assert_eq!(catalog.first_unresolved(0), Some(0));
        assert!(catalog.update_value(0, 7));
        assert_eq!(catalog.first_unresolved(0), Some(1));
        assert_eq!(catalog.first_unresolved(2), None);
        assert!(!catalog.update_value(5, 7));
        assert_eq!(catalog.unresolved_count(), 1);
    }
}
