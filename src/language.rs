//! Language packs understood by the recognition engine.

use std::{collections::BTreeSet, fmt, str::FromStr};

use schemars::JsonSchema;

use crate::{errors::PipelineError, prelude::*};

/// A language pack we know how to ask the recognition engine for.
///
/// The serialized form is the tesseract traineddata name, which is also what we
/// accept on the command line.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    JsonSchema,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub enum Language {
    #[serde(rename = "eng")]
    English,
    #[serde(rename = "fra")]
    French,
    #[serde(rename = "ara")]
    Arabic,
    #[serde(rename = "deu")]
    German,
    #[serde(rename = "chi_sim")]
    SimplifiedChinese,
    #[serde(rename = "rus")]
    Russian,
}

impl Language {
    /// Every language pack we support, in display order.
    pub const ALL: [Language; 6] = [
        Language::English,
        Language::French,
        Language::Arabic,
        Language::German,
        Language::SimplifiedChinese,
        Language::Russian,
    ];

    /// The engine's code for this language.
    pub fn code(self) -> &'static str {
        match self {
            Language::English => "eng",
            Language::French => "fra",
            Language::Arabic => "ara",
            Language::German => "deu",
            Language::SimplifiedChinese => "chi_sim",
            Language::Russian => "rus",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Language {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        // Accept a few common two-letter aliases, because nobody remembers
        // that French is "fra".
        match s.trim().to_ascii_lowercase().as_str() {
            "eng" | "en" => Ok(Language::English),
            "fra" | "fr" => Ok(Language::French),
            "ara" | "ar" => Ok(Language::Arabic),
            "deu" | "de" => Ok(Language::German),
            "chi_sim" | "zh" => Ok(Language::SimplifiedChinese),
            "rus" | "ru" => Ok(Language::Russian),
            other => Err(anyhow!(
                "unsupported language {:?} (supported: {})",
                other,
                Language::ALL.map(Language::code).join(", ")
            )),
        }
    }
}

/// The language packs installed on this host.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InstalledLanguages(BTreeSet<Language>);

impl InstalledLanguages {
    /// Build from an explicit list.
    pub fn new(languages: impl IntoIterator<Item = Language>) -> Self {
        Self(languages.into_iter().collect())
    }

    /// Parse the output of `tesseract --list-langs`, ignoring packs we don't
    /// support (`osd`, `equ`, etc.).
    pub fn from_list_langs_output(output: &str) -> Self {
        Self(
            output
                .lines()
                // The first line is a header like `List of available languages
                // in "/usr/share/tesseract-ocr/5/tessdata/" (3):`.
                .filter(|line| !line.contains(' '))
                .filter_map(|line| line.parse::<Language>().ok())
                .collect(),
        )
    }

    /// Is this language installed?
    pub fn contains(&self, language: Language) -> bool {
        self.0.contains(&language)
    }

    /// Iterate over installed languages.
    pub fn iter(&self) -> impl Iterator<Item = Language> + '_ {
        self.0.iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The languages requested for one document, in priority order.
///
/// Always non-empty and free of duplicates. Construct with
/// [`LanguageList::validate`] to also check against installed packs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LanguageList(Vec<Language>);

impl LanguageList {
    /// Check a requested language list against the installed packs.
    ///
    /// Duplicates are dropped, keeping the first occurrence, so that the
    /// priority order is preserved.
    pub fn validate(
        requested: &[Language],
        installed: &InstalledLanguages,
    ) -> Result<Self, PipelineError> {
        if requested.is_empty() {
            return Err(PipelineError::InvalidRequest(
                "at least one language must be requested".to_owned(),
            ));
        }
        let missing = requested
            .iter()
            .filter(|lang| !installed.contains(**lang))
            .map(|lang| lang.code())
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            return Err(PipelineError::InvalidRequest(format!(
                "language pack(s) not installed: {}",
                missing.join(", ")
            )));
        }

        let mut seen = BTreeSet::new();
        let languages = requested
            .iter()
            .copied()
            .filter(|lang| seen.insert(*lang))
            .collect();
        Ok(Self(languages))
    }

    /// Iterate in priority order.
    pub fn iter(&self) -> impl Iterator<Item = Language> + '_ {
        self.0.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}
