use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Cursor;
use thiserror::Error;

pub const ALLOW_DYLD_ENVIRONMENT_VARIABLES: &str =
    "com.apple.security.cs.allow-dyld-environment-variables";
pub const ALLOW_UNSIGNED_EXECUTABLE_MEMORY: &str =
    "com.apple.security.cs.allow-unsigned-executable-memory";
pub const DISABLE_LIBRARY_VALIDATION: &str = "com.apple.security.cs.disable-library-validation";
pub const GET_TASK_ALLOW: &str = "com.apple.security.get-task-allow";

/// Entitlements the loader needs on the target's main executable.
pub fn loader_entitlements() -> EntitlementSet {
    [
        ALLOW_DYLD_ENVIRONMENT_VARIABLES,
        ALLOW_UNSIGNED_EXECUTABLE_MEMORY,
        DISABLE_LIBRARY_VALIDATION,
        GET_TASK_ALLOW,
    ]
    .into_iter()
    .map(|key| (key.to_string(), EntitlementValue::Bool(true)))
    .collect()
}

/// Numeric entitlement value.
///
/// codesign may hand back an integer where the expected set holds a real (or
/// the reverse), so equality is numeric rather than representational.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(untagged)]
pub enum Number {
    Integer(i64),
    Unsigned(u64),
    Real(f64),
}

impl Number {
    fn as_integral(&self) -> Option<i128> {
        match *self {
            Number::Integer(v) => Some(i128::from(v)),
            Number::Unsigned(v) => Some(i128::from(v)),
            Number::Real(_) => None,
        }
    }
}

fn real_matches_integral(real: f64, integral: i128) -> bool {
    real.is_finite() && real.fract() == 0.0 && real as i128 == integral && integral as f64 == real
}

impl PartialEq for Number {
    fn eq(&self, other: &Self) -> bool {
        match (self.as_integral(), other.as_integral()) {
            (Some(a), Some(b)) => a == b,
            (Some(a), None) => matches!(*other, Number::Real(r) if real_matches_integral(r, a)),
            (None, Some(b)) => matches!(*self, Number::Real(r) if real_matches_integral(r, b)),
            (None, None) => match (*self, *other) {
                // Bitwise match keeps NaN reflexive.
                (Number::Real(a), Number::Real(b)) => a == b || a.to_bits() == b.to_bits(),
                _ => false,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum EntitlementValue {
    Bool(bool),
    String(String),
    Number(Number),
    Sequence(Vec<EntitlementValue>),
    Mapping(BTreeMap<String, EntitlementValue>),
}

/// Structural equality: sequences compare index-for-index, mappings by key
/// set and recursively by value. Shapes never coerce into one another apart
/// from the numeric rule on [`Number`].
impl PartialEq for EntitlementValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (EntitlementValue::Bool(a), EntitlementValue::Bool(b)) => a == b,
            (EntitlementValue::String(a), EntitlementValue::String(b)) => a == b,
            (EntitlementValue::Number(a), EntitlementValue::Number(b)) => a == b,
            (EntitlementValue::Sequence(a), EntitlementValue::Sequence(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x == y)
            }
            (EntitlementValue::Mapping(a), EntitlementValue::Mapping(b)) => {
                a.len() == b.len()
                    && a
                        .iter()
                        .all(|(key, value)| b.get(key).is_some_and(|other| value == other))
            }
            _ => false,
        }
    }
}

impl From<bool> for EntitlementValue {
    fn from(value: bool) -> Self {
        EntitlementValue::Bool(value)
    }
}

impl From<&str> for EntitlementValue {
    fn from(value: &str) -> Self {
        EntitlementValue::String(value.to_string())
    }
}

impl From<String> for EntitlementValue {
    fn from(value: String) -> Self {
        EntitlementValue::String(value)
    }
}

impl From<i64> for EntitlementValue {
    fn from(value: i64) -> Self {
        EntitlementValue::Number(Number::Integer(value))
    }
}

impl From<f64> for EntitlementValue {
    fn from(value: f64) -> Self {
        EntitlementValue::Number(Number::Real(value))
    }
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed property list: {0}")]
    Malformed(#[from] plist::Error),
    #[error("entitlements root is a {0}, expected a dictionary")]
    NotADictionary(&'static str),
    #[error("unsupported {kind} value at {key}")]
    UnsupportedValue { key: String, kind: &'static str },
    #[error("integer at {0} does not fit in 64 bits")]
    IntegerOutOfRange(String),
}

/// One expected entitlement that the observed set does not carry as expected.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Divergence {
    pub key: String,
    pub expected: EntitlementValue,
    pub observed: Option<EntitlementValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct EntitlementSet {
    entries: BTreeMap<String, EntitlementValue>,
}

impl EntitlementSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<EntitlementValue>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&EntitlementValue> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &EntitlementValue)> {
        self.entries.iter()
    }

    /// Subset comparison: every key of `self` must be present in `observed`
    /// with an equal value. Keys only `observed` carries are ignored.
    pub fn satisfied_by(&self, observed: &EntitlementSet) -> bool {
        self.divergences(observed).is_empty()
    }

    pub fn divergences(&self, observed: &EntitlementSet) -> Vec<Divergence> {
        let mut out = Vec::new();
        for (key, expected) in &self.entries {
            match observed.get(key) {
                Some(actual) if actual == expected => {}
                Some(actual) => {
                    tracing::debug!(
                        key = %key,
                        expected = ?expected,
                        observed = ?actual,
                        "entitlement mismatch"
                    );
                    out.push(Divergence {
                        key: key.clone(),
                        expected: expected.clone(),
                        observed: Some(actual.clone()),
                    });
                }
                None => {
                    tracing::debug!(key = %key, "entitlement missing");
                    out.push(Divergence {
                        key: key.clone(),
                        expected: expected.clone(),
                        observed: None,
                    });
                }
            }
        }
        out
    }

    /// Decodes the property list printed by `codesign -d --entitlements :- --xml`.
    pub fn from_plist_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        let root = plist::Value::from_reader(Cursor::new(bytes))?;
        match root {
            plist::Value::Dictionary(dict) => {
                let mut entries = BTreeMap::new();
                for (key, value) in dict {
                    let converted = from_plist(value, &key)?;
                    entries.insert(key, converted);
                }
                Ok(Self { entries })
            }
            other => Err(ParseError::NotADictionary(plist_kind(&other))),
        }
    }

    pub fn to_plist_xml(&self) -> Result<Vec<u8>, plist::Error> {
        let dict: plist::Dictionary = self
            .entries
            .iter()
            .map(|(key, value)| (key.clone(), to_plist(value)))
            .collect();
        let mut buf = Vec::new();
        plist::Value::Dictionary(dict).to_writer_xml(&mut buf)?;
        Ok(buf)
    }
}

impl FromIterator<(String, EntitlementValue)> for EntitlementSet {
    fn from_iter<I: IntoIterator<Item = (String, EntitlementValue)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

fn plist_kind(value: &plist::Value) -> &'static str {
    match value {
        plist::Value::Array(_) => "array",
        plist::Value::Dictionary(_) => "dictionary",
        plist::Value::Boolean(_) => "boolean",
        plist::Value::Data(_) => "data",
        plist::Value::Date(_) => "date",
        plist::Value::Real(_) => "real",
        plist::Value::Integer(_) => "integer",
        plist::Value::String(_) => "string",
        plist::Value::Uid(_) => "uid",
        _ => "unknown",
    }
}

fn from_plist(value: plist::Value, key: &str) -> Result<EntitlementValue, ParseError> {
    match value {
        plist::Value::Boolean(v) => Ok(EntitlementValue::Bool(v)),
        plist::Value::String(v) => Ok(EntitlementValue::String(v)),
        plist::Value::Real(v) => Ok(EntitlementValue::Number(Number::Real(v))),
        plist::Value::Integer(v) => {
            if let Some(signed) = v.as_signed() {
                Ok(EntitlementValue::Number(Number::Integer(signed)))
            } else if let Some(unsigned) = v.as_unsigned() {
                Ok(EntitlementValue::Number(Number::Unsigned(unsigned)))
            } else {
                Err(ParseError::IntegerOutOfRange(key.to_string()))
            }
        }
        plist::Value::Array(items) => items
            .into_iter()
            .enumerate()
            .map(|(idx, item)| from_plist(item, &format!("{key}[{idx}]")))
            .collect::<Result<Vec<_>, _>>()
            .map(EntitlementValue::Sequence),
        plist::Value::Dictionary(dict) => {
            let mut map = BTreeMap::new();
            for (child, item) in dict {
                let converted = from_plist(item, &format!("{key}.{child}"))?;
                map.insert(child, converted);
            }
            Ok(EntitlementValue::Mapping(map))
        }
        other => Err(ParseError::UnsupportedValue {
            key: key.to_string(),
            kind: plist_kind(&other),
        }),
    }
}

fn to_plist(value: &EntitlementValue) -> plist::Value {
    match value {
        EntitlementValue::Bool(v) => plist::Value::Boolean(*v),
        EntitlementValue::String(v) => plist::Value::String(v.clone()),
        EntitlementValue::Number(Number::Integer(v)) => plist::Value::Integer((*v).into()),
        EntitlementValue::Number(Number::Unsigned(v)) => plist::Value::Integer((*v).into()),
        EntitlementValue::Number(Number::Real(v)) => plist::Value::Real(*v),
        EntitlementValue::Sequence(items) => {
            plist::Value::Array(items.iter().map(to_plist).collect())
        }
        EntitlementValue::Mapping(map) => plist::Value::Dictionary(
            map.iter()
                .map(|(key, item)| (key.clone(), to_plist(item)))
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CODESIGN_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN"
 "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
	<key>com.apple.security.cs.allow-dyld-environment-variables</key>
	<true/>
	<key>com.apple.security.cs.disable-library-validation</key>
	<true/>
	<key>com.apple.security.application-groups</key>
	<array>
		<string>group.example</string>
	</array>
	<key>com.example.limits</key>
	<dict>
		<key>max</key>
		<integer>4</integer>
		<key>ratio</key>
		<real>0.5</real>
	</dict>
</dict>
</plist>"#;

    fn mapping(pairs: &[(&str, EntitlementValue)]) -> EntitlementValue {
        EntitlementValue::Mapping(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        )
    }

    #[test]
    fn numbers_compare_across_encodings() {
        assert_eq!(EntitlementValue::from(1i64), EntitlementValue::from(1.0f64));
        assert_eq!(
            EntitlementValue::Number(Number::Unsigned(7)),
            EntitlementValue::Number(Number::Integer(7))
        );
        assert_ne!(EntitlementValue::from(1i64), EntitlementValue::from(1.5f64));
        assert_ne!(EntitlementValue::from(1i64), EntitlementValue::from("1"));
    }

    #[test]
    fn shapes_never_coerce() {
        assert_ne!(EntitlementValue::from(true), EntitlementValue::from("true"));
        assert_ne!(
            EntitlementValue::Sequence(vec![]),
            EntitlementValue::Mapping(BTreeMap::new())
        );
        assert_ne!(
            EntitlementValue::Sequence(vec![true.into()]),
            EntitlementValue::from(true)
        );
    }

    #[test]
    fn sequences_are_order_sensitive() {
        let a = EntitlementValue::Sequence(vec![true.into(), false.into()]);
        let b = EntitlementValue::Sequence(vec![false.into(), true.into()]);
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
        assert_ne!(a, EntitlementValue::Sequence(vec![true.into()]));
    }

    #[test]
    fn mappings_ignore_insertion_order() {
        let a = mapping(&[
            ("a", 1i64.into()),
            ("b", mapping(&[("x", "y".into())])),
        ]);
        let b = mapping(&[
            ("b", mapping(&[("x", "y".into())])),
            ("a", 1.0f64.into()),
        ]);
        assert_eq!(a, b);
        assert_eq!(b, a);

        let c = mapping(&[
            ("a", 1i64.into()),
            ("b", mapping(&[("x", "z".into())])),
        ]);
        assert_ne!(a, c);
        assert_ne!(a, mapping(&[("a", 1i64.into())]));
    }

    #[test]
    fn subset_ignores_extra_observed_keys() {
        let mut expected = EntitlementSet::new();
        expected.insert(ALLOW_DYLD_ENVIRONMENT_VARIABLES, true);

        let mut observed = expected.clone();
        observed.insert(GET_TASK_ALLOW, true);
        observed.insert("com.example.other", "value");
        assert!(expected.satisfied_by(&observed));
        assert!(!observed.satisfied_by(&expected));
        assert!(expected.satisfied_by(&expected));
    }

    #[test]
    fn missing_or_changed_key_is_reported() {
        let expected = loader_entitlements();
        let mut observed = expected.clone();
        observed.insert(GET_TASK_ALLOW, false);
        observed.entries.remove(DISABLE_LIBRARY_VALIDATION);

        let divergences = expected.divergences(&observed);
        assert_eq!(divergences.len(), 2);
        assert_eq!(divergences[0].key, DISABLE_LIBRARY_VALIDATION);
        assert_eq!(divergences[0].observed, None);
        assert_eq!(divergences[1].key, GET_TASK_ALLOW);
        assert_eq!(divergences[1].observed, Some(EntitlementValue::Bool(false)));
        assert!(!expected.satisfied_by(&EntitlementSet::new()));
    }

    #[test]
    fn parses_codesign_output() {
        let set = EntitlementSet::from_plist_bytes(CODESIGN_XML.as_bytes()).expect("parse");
        assert_eq!(set.len(), 4);
        assert_eq!(
            set.get(ALLOW_DYLD_ENVIRONMENT_VARIABLES),
            Some(&EntitlementValue::Bool(true))
        );
        assert_eq!(
            set.get("com.apple.security.application-groups"),
            Some(&EntitlementValue::Sequence(vec!["group.example".into()]))
        );
        assert_eq!(
            set.get("com.example.limits"),
            Some(&mapping(&[("max", 4.0f64.into()), ("ratio", 0.5f64.into())]))
        );
    }

    #[test]
    fn rejects_non_dictionary_root() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0"><array><true/></array></plist>"#;
        let err = EntitlementSet::from_plist_bytes(xml.as_bytes()).unwrap_err();
        assert!(matches!(err, ParseError::NotADictionary("array")));
        assert!(EntitlementSet::from_plist_bytes(b"not a plist").is_err());
    }

    #[test]
    fn rejects_data_values() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0"><dict><key>blob</key><data>AAEC</data></dict></plist>"#;
        let err = EntitlementSet::from_plist_bytes(xml.as_bytes()).unwrap_err();
        match err {
            ParseError::UnsupportedValue { key, kind } => {
                assert_eq!(key, "blob");
                assert_eq!(kind, "data");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn descriptor_xml_reads_back_equal() {
        let mut set = loader_entitlements();
        set.insert(
            "com.example.nested",
            mapping(&[("list", EntitlementValue::Sequence(vec![2i64.into()]))]),
        );
        let xml = set.to_plist_xml().expect("serialize");
        let text = String::from_utf8(xml.clone()).expect("utf8");
        assert!(text.contains("<key>com.apple.security.get-task-allow</key>"));
        assert_eq!(EntitlementSet::from_plist_bytes(&xml).expect("parse"), set);
    }

    #[test]
    fn serializes_to_plain_json() {
        let mut set = EntitlementSet::new();
        set.insert(GET_TASK_ALLOW, true);
        set.insert("com.example.count", 3i64);
        let json = serde_json::to_value(&set).expect("json");
        assert_eq!(json[GET_TASK_ALLOW], serde_json::Value::Bool(true));
        assert_eq!(json["com.example.count"], 3);
    }
}
