//! Plate text assembly and normalisation.

use std::fmt;

use crate::detect::{CharDetection, Recognition};

/// Recognised plate text: non-empty, uppercase ASCII letters and digits only.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlateText(String);

impl PlateText {
    /// Strip everything but ASCII letters and digits and fold to uppercase.
    /// Returns `None` when nothing is left, which callers treat as "no detection".
    pub fn normalize(raw: &str) -> Option<Self> {
        let text: String = raw
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_uppercase())
            .collect();
        if text.is_empty() {
            None
        } else {
            Some(Self(text))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for PlateText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PlateText {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Character for a recognition class id: 0-9 are digits, 10-35 are `A`-`Z`.
pub fn char_for_class(class_id: u32) -> Option<char> {
    match class_id {
        0..=9 => char::from_digit(class_id, 10),
        10..=35 => char::from_u32('A' as u32 + class_id - 10),
        _ => None,
    }
}

/// Concatenate character detections in left-to-right order.
///
/// Detections sharing an x position keep their input order.
pub fn assemble_characters(characters: &[CharDetection]) -> String {
    let mut ordered: Vec<&CharDetection> = characters.iter().collect();
    ordered.sort_by(|a, b| a.x.total_cmp(&b.x));
    ordered.into_iter().map(|c| c.character).collect()
}

/// Plate text from either recognition form.
pub fn plate_from_recognition(recognition: &Recognition) -> Option<PlateText> {
    match recognition {
        Recognition::Characters(characters) => {
            PlateText::normalize(&assemble_characters(characters))
        }
        Recognition::Text(text) => PlateText::normalize(text),
    }
}
