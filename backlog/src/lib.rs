//! Backlog document library: a typed model for hand-edited Markdown backlogs.
//! Modules keep the document operations pure: parse text into a tree, patch
//! items, and format the tree back to text without disturbing untouched spans.

pub mod core {
    use serde::{Deserialize, Serialize};

    /* ------------------------------ Aggregate ------------------------------ */

    /// Aggregate root: one backlog document.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct Backlog {
        /// Raw lead-in text before the first section heading.
        #[serde(default)]
        pub header: String,

        /// Raw table-of-contents block. Never part of `sections`.
        #[serde(default)]
        pub table_of_contents: String,

        #[serde(default)]
        pub sections: Vec<Section>,

        /// Trailing text after the closing rule of the last section.
        pub footer: Option<String>,
    }

    impl Backlog {
        /// First backlog item carrying `id`, in document order.
        pub fn item(&self, id: &str) -> Result<&BacklogItem, BacklogError> {
            self.sections
                .iter()
                .flat_map(|s| s.backlog_items())
                .find(|item| item.id == id)
                .ok_or_else(|| BacklogError::ItemNotFound(id.to_string()))
        }

        /// Swap the first item sharing `item.id` for `item`. Returns false when no item matched.
        pub fn replace_item(&mut self, item: BacklogItem) -> bool {
            for section in &mut self.sections {
                for slot in &mut section.items {
                    if let Item::Backlog(existing) = slot {
                        if existing.id == item.id {
                            *existing = item;
                            return true;
                        }
                    }
                }
            }
            false
        }

        /// Append a new item at the end of the section at `section_index`.
        pub fn insert_item(&mut self, section_index: usize, mut item: BacklogItem) -> bool {
            let Some(section) = self.sections.get_mut(section_index) else {
                return false;
            };
            item.section_index = section_index;
            item.modified = true;
            section.items.push(Item::Backlog(item));
            true
        }

        /// Remove the first item carrying `id`.
        pub fn remove_item(&mut self, id: &str) -> Option<BacklogItem> {
            for section in &mut self.sections {
                let pos = section
                    .items
                    .iter()
                    .position(|slot| matches!(slot, Item::Backlog(it) if it.id == id));
                if let Some(pos) = pos {
                    if let Item::Backlog(item) = section.items.remove(pos) {
                        return Some(item);
                    }
                }
            }
            None
        }
    }

    /// A level-2 grouping of items.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Section {
        /// Numeric prefix of the heading, or the 1-based position when the heading has none.
        pub id: String,
        pub title: String,
        /// Heading line exactly as it appeared in the source.
        pub raw_header: String,
        #[serde(default)]
        pub items: Vec<Item>,
    }

    impl Section {
        pub fn backlog_items(&self) -> impl Iterator<Item = &BacklogItem> {
            self.items.iter().filter_map(Item::as_backlog_item)
        }
    }

    /* ------------------------------- Items ------------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(tag = "kind", rename_all = "snake_case")]
    pub enum Item {
        #[serde(rename = "item")]
        Backlog(BacklogItem),
        TableGroup(TableGroup),
        /// Opaque passthrough for content that is neither an item nor a table group.
        Raw(RawSection),
    }

    impl Item {
        pub fn raw_markdown(&self) -> &str {
            match self {
                Item::Backlog(item) => &item.raw_markdown,
                Item::TableGroup(group) => &group.raw_markdown,
                Item::Raw(raw) => &raw.raw_markdown,
            }
        }

        pub fn as_backlog_item(&self) -> Option<&BacklogItem> {
            match self {
                Item::Backlog(item) => Some(item),
                Item::TableGroup(_) | Item::Raw(_) => None,
            }
        }
    }

    /// A single ticket with its structured metadata.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct BacklogItem {
        /// `LETTERS-DIGITS`, e.g. `BUG-001`.
        pub id: String,
        /// Letters portion of `id`.
        #[serde(rename = "type")]
        pub item_type: String,
        pub title: String,
        pub emoji: Option<String>,

        pub component: Option<String>,
        pub module: Option<String>,
        /// Short code `P0`..`P4` when one was recognized.
        pub severity: Option<String>,
        pub priority: Option<String>,
        /// Short code `XS`..`XL` when one was recognized.
        pub effort: Option<String>,
        pub description: Option<String>,
        pub user_story: Option<String>,

        #[serde(default)]
        pub specs: Vec<String>,
        #[serde(default)]
        pub reproduction: Vec<String>,
        #[serde(default)]
        pub screens: Vec<String>,
        #[serde(default)]
        pub criteria: Vec<Criterion>,
        #[serde(default)]
        pub dependencies: Vec<String>,
        #[serde(default)]
        pub constraints: Vec<String>,
        #[serde(default)]
        pub screenshots: Vec<Screenshot>,

        /// Source span for this item, heading through its trailing separator.
        #[serde(default)]
        pub raw_markdown: String,
        #[serde(default)]
        pub section_index: usize,
        /// When set, the formatter rebuilds this item instead of copying `raw_markdown`.
        #[serde(default)]
        pub modified: bool,
    }

    impl BacklogItem {
        /// A fresh item with no source text; it is always rebuilt when formatted.
        pub fn new(id: &str, title: &str) -> Self {
            Self {
                id: id.to_string(),
                item_type: id.split('-').next().unwrap_or_default().to_string(),
                title: title.to_string(),
                modified: true,
                ..Self::default()
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Criterion {
        pub text: String,
        pub checked: bool,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Screenshot {
        pub filename: String,
        pub alt: Option<String>,
    }

    /// An ID-range heading backed by a pipe table; always formatted from `raw_markdown`.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TableGroup {
        /// Range text from the heading, e.g. `BUG-005 à 007`.
        pub range: String,
        pub title: String,
        pub severity: Option<String>,
        #[serde(default)]
        pub items: Vec<TableRow>,
        pub raw_markdown: String,
        #[serde(default)]
        pub section_index: usize,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TableRow {
        pub id: String,
        pub description: String,
        pub action: String,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct RawSection {
        pub raw_markdown: String,
        #[serde(default)]
        pub section_index: usize,
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    #[derive(Debug, thiserror::Error)]
    pub enum BacklogError {
        #[error("no item with id {0}")]
        ItemNotFound(String),
        #[error("item {id} has {len} criteria, index {index} is out of range")]
        CriterionOutOfRange { id: String, index: usize, len: usize },
        #[error("no section matches type {0}")]
        SectionNotFound(String),
        #[error("{0:?} is not a valid item id (expected LETTERS-DIGITS)")]
        InvalidId(String),
    }
}

pub mod vocab {
    //! Localized label vocabulary of the backlog dialect.
    //!
    //! Labels are matched case-insensitively; the first label listed for a field is the
    //! one the builder writes back.

    /// Structured fields promoted from `**Label:**` lines.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Field {
        Component,
        Module,
        Severity,
        Priority,
        Effort,
        Description,
        UserStory,
        Criteria,
        Specs,
        Reproduction,
        Screens,
        Dependencies,
        Constraints,
        Screenshots,
    }

    impl Field {
        pub fn label(self) -> &'static str {
            match self {
                Field::Component => "Composant",
                Field::Module => "Module",
                Field::Severity => "Sévérité",
                Field::Priority => "Priorité",
                Field::Effort => "Effort",
                Field::Description => "Description",
                Field::UserStory => "User Story",
                Field::Criteria => "Critères d'acceptation",
                Field::Specs => "Spécifications",
                Field::Reproduction => "Reproduction",
                Field::Screens => "Écrans",
                Field::Dependencies => "Dépendances",
                Field::Constraints => "Contraintes",
                Field::Screenshots => "Screenshots",
            }
        }

        /// Whether the value sits on the label line itself.
        pub fn is_inline(self) -> bool {
            matches!(
                self,
                Field::Component
                    | Field::Module
                    | Field::Severity
                    | Field::Priority
                    | Field::Effort
                    | Field::Description
            )
        }
    }

    const LABELS: &[(&str, Field)] = &[
        ("composant", Field::Component),
        ("component", Field::Component),
        ("module", Field::Module),
        ("sévérité", Field::Severity),
        ("severite", Field::Severity),
        ("severity", Field::Severity),
        ("priorité", Field::Priority),
        ("priorite", Field::Priority),
        ("priority", Field::Priority),
        ("effort", Field::Effort),
        ("description", Field::Description),
        ("user story", Field::UserStory),
        ("critères d'acceptation", Field::Criteria),
        ("criteres d'acceptation", Field::Criteria),
        ("critères d'acceptance", Field::Criteria),
        ("critères", Field::Criteria),
        ("acceptance criteria", Field::Criteria),
        ("spécifications", Field::Specs),
        ("specifications", Field::Specs),
        ("spécifications techniques", Field::Specs),
        ("specs", Field::Specs),
        ("reproduction", Field::Reproduction),
        ("étapes de reproduction", Field::Reproduction),
        ("steps to reproduce", Field::Reproduction),
        ("écrans", Field::Screens),
        ("ecrans", Field::Screens),
        ("screens", Field::Screens),
        ("dépendances", Field::Dependencies),
        ("dependances", Field::Dependencies),
        ("dependencies", Field::Dependencies),
        ("contraintes", Field::Constraints),
        ("constraints", Field::Constraints),
        ("screenshots", Field::Screenshots),
        ("captures", Field::Screenshots),
        ("captures d'écran", Field::Screenshots),
    ];

    pub fn field_for_label(label: &str) -> Option<Field> {
        let key = label
            .trim()
            .trim_end_matches(':')
            .trim()
            .replace('’', "'")
            .to_lowercase();
        LABELS
            .iter()
            .find(|(candidate, _)| *candidate == key)
            .map(|(_, field)| *field)
    }

    /* ------------------------------ Severity ------------------------------ */

    pub fn severity_label(code: &str) -> Option<&'static str> {
        match code {
            "P0" => Some("P0 - Critique"),
            "P1" => Some("P1 - Haute"),
            "P2" => Some("P2 - Moyenne"),
            "P3" => Some("P3 - Basse"),
            "P4" => Some("P4 - Mineure"),
            _ => None,
        }
    }

    pub const EFFORT_CODES: &[&str] = &["XS", "S", "M", "L", "XL"];

    /* --------------------------- Table of contents --------------------------- */

    const TOC_TITLES: &[&str] = &[
        "table des matières",
        "table des matieres",
        "table of contents",
        "sommaire",
    ];

    pub fn is_toc_title(title: &str) -> bool {
        let lower = title.to_lowercase();
        TOC_TITLES.iter().any(|t| lower.contains(t))
    }

    /* ------------------------------ Item types ------------------------------ */

    /// A backlog type code and the section titles that host it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TypeDef {
        pub code: &'static str,
        /// Title used for new sections; always the first synonym.
        pub synonyms: &'static [&'static str],
    }

    pub const TYPES: &[TypeDef] = &[
        TypeDef {
            code: "BUG",
            synonyms: &["BUGS", "BUG"],
        },
        TypeDef {
            code: "CT",
            synonyms: &["COURT TERME", "COURT-TERME"],
        },
        TypeDef {
            code: "LT",
            synonyms: &["LONG TERME", "LONG-TERME"],
        },
        TypeDef {
            code: "FEAT",
            synonyms: &["FEATURES", "FEATURE", "FONCTIONNALITÉS", "FONCTIONNALITES"],
        },
        TypeDef {
            code: "EXT",
            synonyms: &["EXTENSIONS", "EXTENSION"],
        },
        TypeDef {
            code: "ADM",
            synonyms: &["ADMINISTRATION", "ADMIN"],
        },
        TypeDef {
            code: "AUTO",
            synonyms: &["AUTOMATISATION", "AUTOMATION"],
        },
        TypeDef {
            code: "TECH",
            synonyms: &["TECHNIQUE", "DETTE TECHNIQUE", "TECH"],
        },
        TypeDef {
            code: "DOC",
            synonyms: &["DOCUMENTATION", "DOC"],
        },
    ];

    /// Section-title synonyms for a type code. Unknown codes map to `{CODE, CODES}`.
    pub fn type_labels(code: &str) -> Vec<String> {
        let code = code.trim().to_uppercase();
        match TYPES.iter().find(|t| t.code == code) {
            Some(def) => def.synonyms.iter().map(|s| s.to_string()).collect(),
            None => vec![format!("{code}S"), code],
        }
    }

    /// Title for a new section hosting `code`.
    pub fn type_section_title(code: &str) -> String {
        type_labels(code).into_iter().next().unwrap_or_default()
    }
}

pub mod classify {
    //! Line classifier. The section and item scanners dispatch on [`Line`] only.
    //!
    //! Each recognizer is a small `nom` parser over one line; [`classify`] tries them in a
    //! fixed order so that, e.g., a checkbox line never reads as a plain bullet.

    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{tag, take_until, take_while1},
        character::complete::{char, digit1, one_of, space0, space1},
        combinator::{opt, recognize},
        error::{VerboseError, VerboseErrorKind},
        sequence::{terminated, tuple},
    };

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Line<'a> {
        Blank,
        Rule,
        /// `## [N. ]Title`
        SectionHeading {
            number: Option<&'a str>,
            title: &'a str,
        },
        /// `### ID | Title`
        ItemHeading {
            id: &'a str,
            title: &'a str,
        },
        /// `### BUG-005 à 007 | Title`
        RangeHeading {
            range: &'a str,
            title: &'a str,
        },
        /// `**Label:** value`
        Metadata {
            label: &'a str,
            value: &'a str,
        },
        Checkbox {
            checked: bool,
            text: &'a str,
        },
        Bullet(&'a str),
        Numbered(&'a str),
        Quote(&'a str),
        Image {
            alt: &'a str,
            path: &'a str,
        },
        TableRow(&'a str),
        Other(&'a str),
    }

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    fn fail<'a, T>(i: &'a str, ctx: &'static str) -> PResult<'a, T> {
        Err(nom::Err::Error(VerboseError {
            errors: vec![(i, VerboseErrorKind::Context(ctx))],
        }))
    }

    pub fn classify(line: &str) -> Line<'_> {
        let line = line.trim_end();
        let trimmed = line.trim_start();
        if trimmed.is_empty() {
            return Line::Blank;
        }
        if is_rule(trimmed) {
            return Line::Rule;
        }
        if let Ok((_, (number, title))) = section_heading(line) {
            return Line::SectionHeading { number, title };
        }
        if let Ok((_, (id, title))) = item_heading(trimmed) {
            return Line::ItemHeading { id, title };
        }
        if let Ok((_, (range, title))) = range_heading(trimmed) {
            return Line::RangeHeading { range, title };
        }
        if let Ok((_, (alt, path))) = image(trimmed) {
            return Line::Image { alt, path };
        }
        if let Ok((_, (label, value))) = metadata(trimmed) {
            return Line::Metadata { label, value };
        }
        if let Ok((_, (checked, text))) = checkbox(line) {
            return Line::Checkbox { checked, text };
        }
        if let Some(rest) = trimmed.strip_prefix('>') {
            return Line::Quote(rest.trim());
        }
        if trimmed.starts_with('|') {
            return Line::TableRow(trimmed);
        }
        if let Ok((text, _)) = bullet_marker(line) {
            return Line::Bullet(text.trim());
        }
        if let Ok((text, _)) = numbered_marker(line) {
            return Line::Numbered(text.trim());
        }
        Line::Other(line)
    }

    pub fn is_rule(trimmed: &str) -> bool {
        trimmed.len() >= 3
            && ['-', '*', '_']
                .iter()
                .any(|c| trimmed.chars().all(|x| x == *c))
    }

    /* ------------------------------- Item ids ------------------------------- */

    fn item_id(i: &str) -> PResult<'_, &str> {
        recognize(tuple((
            take_while1(|c: char| c.is_ascii_uppercase()),
            char('-'),
            digit1,
        )))(i)
    }

    /// Split a strict `LETTERS-DIGITS` id into its two halves.
    pub fn split_item_id(s: &str) -> Option<(&str, &str)> {
        match item_id(s) {
            Ok(("", id)) => id.split_once('-'),
            _ => None,
        }
    }

    /* ------------------------------- Headings ------------------------------- */

    fn section_heading(i: &str) -> PResult<'_, (Option<&str>, &str)> {
        let (i, _) = tag("##")(i)?;
        if i.starts_with('#') {
            return fail(i, "section-heading-level");
        }
        let (i, _) = space0(i)?;
        let (i, number) = opt(terminated(digit1, tuple((char('.'), space0))))(i)?;
        Ok(("", (number, i.trim())))
    }

    fn heading3_marker(i: &str) -> PResult<'_, &str> {
        recognize(tuple((tag("###"), opt(char('#')), space0)))(i)
    }

    fn item_heading(i: &str) -> PResult<'_, (&str, &str)> {
        let (i, _) = heading3_marker(i)?;
        let (i, id) = item_id(i)?;
        let (i, _) = tuple((space0, char('|'), space0))(i)?;
        Ok(("", (id, i.trim())))
    }

    fn range_joiner(i: &str) -> PResult<'_, &str> {
        alt((tag("à"), tag("to"), tag("–"), tag("—"), tag("-"), tag("a")))(i)
    }

    fn range_heading(i: &str) -> PResult<'_, (&str, &str)> {
        let (i, _) = opt(heading3_marker)(i)?;
        let (i, _) = opt(tag("**"))(i)?;
        let (i, range) = recognize(tuple((
            item_id,
            space0,
            range_joiner,
            space0,
            opt(tuple((take_while1(|c: char| c.is_ascii_uppercase()), char('-')))),
            digit1,
        )))(i)?;
        let (i, _) = opt(tag("**"))(i)?;
        let (i, _) = tuple((space0, char('|'), space0))(i)?;
        Ok(("", (range, i.trim().trim_end_matches("**").trim_end())))
    }

    /* ------------------------------ Field lines ------------------------------ */

    fn metadata(i: &str) -> PResult<'_, (&str, &str)> {
        let (i, _) = tag("**")(i)?;
        let (i, label) = take_until::<&str, _, VerboseError<&str>>("**")(i)?;
        let (i, _) = tag("**")(i)?;
        let (label, i) = match label.trim_end().strip_suffix(':') {
            Some(stripped) => (stripped, i),
            None => {
                let (i, _) = char(':')(i)?;
                (label, i)
            }
        };
        if label.trim().is_empty() {
            return fail(i, "metadata-label");
        }
        Ok(("", (label.trim(), i.trim())))
    }

    fn checkbox_prefix(i: &str) -> PResult<'_, &str> {
        recognize(tuple((space0, one_of("-*+"), space1, char('['))))(i)
    }

    fn checkbox(i: &str) -> PResult<'_, (bool, &str)> {
        let (i, _) = checkbox_prefix(i)?;
        let (i, mark) = one_of(" xX")(i)?;
        let (i, _) = char(']')(i)?;
        Ok(("", (mark != ' ', i.trim())))
    }

    /// Byte offset of the bracket mark in a checkbox line (`- [x] text` gives 3).
    pub fn checkbox_mark_offset(line: &str) -> Option<usize> {
        let (rest, prefix) = checkbox_prefix(line).ok()?;
        let (rest, _) = one_of::<_, _, VerboseError<&str>>(" xX")(rest).ok()?;
        char::<_, VerboseError<&str>>(']')(rest).ok()?;
        Some(prefix.len())
    }

    fn bullet_marker(i: &str) -> PResult<'_, &str> {
        recognize(tuple((space0, one_of("-*+"), space1)))(i)
    }

    fn numbered_marker(i: &str) -> PResult<'_, &str> {
        recognize(tuple((space0, digit1, one_of(".)"), space1)))(i)
    }

    fn image(i: &str) -> PResult<'_, (&str, &str)> {
        let (i, _) = opt(tuple((one_of("-*+"), space1)))(i)?;
        let (i, _) = tag("![")(i)?;
        let (i, alt) = take_until::<&str, _, VerboseError<&str>>("](")(i)?;
        let (i, _) = tag("](")(i)?;
        let (i, path) = take_until::<&str, _, VerboseError<&str>>(")")(i)?;
        let (i, _) = char(')')(i)?;
        Ok((i, (alt.trim(), path.trim())))
    }

    /// Cells of a pipe-table row, outer pipes dropped.
    pub fn table_cells(row: &str) -> Vec<&str> {
        let row = row.trim();
        let row = row.strip_prefix('|').unwrap_or(row);
        let row = row.strip_suffix('|').unwrap_or(row);
        row.split('|').map(str::trim).collect()
    }

}

pub mod parser {
    //! Tolerant backlog parser.
    //!
    //! Parsing strategy:
    //! - Normalize line endings, then split rules that got fused onto a section heading.
    //! - Lines before the first `##` heading form the header; a contents-titled heading
    //!   is lifted out as the table of contents.
    //! - Each remaining `##` heading opens a section whose body is cut into item spans at
    //!   item headings and table-group headings. Anything else is kept as a raw span.
    //!
    //! Parsing never fails; unrecognized input degrades to raw passthrough.

    use crate::classify::{Line, classify, split_item_id, table_cells};
    use crate::core::*;
    use crate::vocab::{self, Field};
    use anyhow::{Context, Result};
    use std::{fs, path::Path};
    use tracing::{debug, trace};

    /* ------------------------ Public entry points ------------------------ */

    /// Parse a backlog document from a string.
    pub fn parse_backlog(input: &str) -> Backlog {
        let text = repair_fused_separators(&normalize_line_endings(input));
        let lines: Vec<&str> = text.lines().collect();

        let headings: Vec<usize> = lines
            .iter()
            .enumerate()
            .filter(|(_, line)| matches!(classify(line), Line::SectionHeading { .. }))
            .map(|(idx, _)| idx)
            .collect();

        let first = headings.first().copied().unwrap_or(lines.len());
        let mut backlog = Backlog {
            header: lines[..first].join("\n").trim().to_string(),
            ..Backlog::default()
        };

        for (k, &start) in headings.iter().enumerate() {
            let end = headings.get(k + 1).copied().unwrap_or(lines.len());
            let Line::SectionHeading { number, title } = classify(lines[start]) else {
                continue;
            };

            if backlog.table_of_contents.is_empty() && vocab::is_toc_title(title) {
                backlog.table_of_contents = table_of_contents(&lines[start..end]);
                continue;
            }

            let section_index = backlog.sections.len();
            let mut body = &lines[start + 1..end];
            if k + 1 == headings.len() {
                let (kept, footer) = split_footer(body);
                body = kept;
                backlog.footer = footer;
            }

            let items = parse_section_body(body, section_index);
            debug!(
                section = section_index,
                title,
                items = items.len(),
                "parsed section"
            );
            backlog.sections.push(Section {
                id: number
                    .map(str::to_string)
                    .unwrap_or_else(|| (section_index + 1).to_string()),
                title: title.to_string(),
                raw_header: lines[start].to_string(),
                items,
            });
        }

        backlog
    }

    /// Read and parse a backlog file.
    pub fn parse_backlog_file(path: &Path) -> Result<Backlog> {
        let text = fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
        Ok(parse_backlog(&text))
    }

    /// Parse one item span (heading line first) into a backlog item.
    pub fn parse_item(span: &str, section_index: usize) -> BacklogItem {
        let mut lines = span.lines();
        let heading = lines.next().unwrap_or_default();
        let (id, title) = match classify(heading) {
            Line::ItemHeading { id, title } => (id, title),
            _ => ("", heading.trim()),
        };
        let (emoji, title) = split_emoji(title);

        let mut item = BacklogItem {
            id: id.to_string(),
            item_type: split_item_id(id)
                .map(|(letters, _)| letters.to_string())
                .unwrap_or_default(),
            title,
            emoji,
            raw_markdown: span.to_string(),
            section_index,
            ..BacklogItem::default()
        };

        let mut current: Option<Field> = None;
        let mut pending_blanks = 0;
        for line in lines {
            let parsed = classify(line);
            if current == Some(Field::Description) && continues_description(&parsed) {
                if parsed == Line::Blank {
                    pending_blanks += 1;
                    continue;
                }
                let description = item.description.get_or_insert_with(String::new);
                if !description.is_empty() {
                    description.push_str(&"\n".repeat(pending_blanks + 1));
                }
                description.push_str(line.trim_end());
                pending_blanks = 0;
                continue;
            }

            match parsed {
                Line::Metadata { label, value } => {
                    current = vocab::field_for_label(label);
                    pending_blanks = 0;
                    if let Some(field) = current {
                        apply_label_value(&mut item, field, value);
                    }
                }
                Line::Quote(text) if current == Some(Field::UserStory) => {
                    let story = item.user_story.get_or_insert_with(String::new);
                    if !story.is_empty() {
                        story.push('\n');
                    }
                    story.push_str(text);
                }
                Line::Checkbox { checked, text } => {
                    item.criteria.push(Criterion {
                        text: text.to_string(),
                        checked,
                    });
                }
                Line::Image { alt, path } => {
                    item.screenshots.push(Screenshot {
                        filename: file_name(path).to_string(),
                        alt: (!alt.is_empty()).then(|| alt.to_string()),
                    });
                }
                Line::Bullet(text) | Line::Numbered(text) => {
                    if let Some(list) = current.and_then(|field| list_field(&mut item, field)) {
                        list.push(text.to_string());
                    }
                }
                Line::Quote(_) | Line::Other(_) | Line::Blank => {}
                Line::Rule
                | Line::SectionHeading { .. }
                | Line::ItemHeading { .. }
                | Line::RangeHeading { .. }
                | Line::TableRow(_) => current = None,
            }
        }

        if item.description.as_deref().is_some_and(str::is_empty) {
            item.description = None;
        }
        item
    }

    /// Parse a table-group span: an ID-range heading followed by a pipe table.
    pub fn parse_table_group(span: &str, section_index: usize) -> TableGroup {
        let mut lines = span.lines();
        let heading = lines.next().unwrap_or_default();
        let (range, title) = match classify(heading) {
            Line::RangeHeading { range, title } => (range, title),
            _ => ("", heading.trim()),
        };

        let mut group = TableGroup {
            range: range.to_string(),
            title: title.to_string(),
            severity: None,
            items: Vec::new(),
            raw_markdown: span.to_string(),
            section_index,
        };

        for line in lines {
            match classify(line) {
                Line::Metadata { label, value }
                    if vocab::field_for_label(label) == Some(Field::Severity) =>
                {
                    group.severity = severity_code(value);
                }
                Line::TableRow(row) => {
                    let cells = table_cells(row);
                    let id = cells
                        .first()
                        .map(|c| c.trim_matches(|ch| ch == '*' || ch == '`').trim())
                        .unwrap_or_default();
                    // Header and alignment rows carry no item id.
                    if split_item_id(id).is_none() {
                        continue;
                    }
                    group.items.push(TableRow {
                        id: id.to_string(),
                        description: cells.get(1).copied().unwrap_or_default().to_string(),
                        action: cells.get(2).copied().unwrap_or_default().to_string(),
                    });
                }
                _ => {}
            }
        }
        group
    }

    /* ------------------------------ Normalizing ------------------------------ */

    pub fn normalize_line_endings(input: &str) -> String {
        input.replace("\r\n", "\n").replace('\r', "\n")
    }

    /// Split a rule that lost its line breaks around a following section heading:
    /// `---## 2. X`, `## 1. A---## 2. B`, or `text---` directly above `## 2. B`.
    pub fn repair_fused_separators(text: &str) -> String {
        let lines: Vec<&str> = text.split('\n').collect();
        let mut out: Vec<&str> = Vec::with_capacity(lines.len());

        for (idx, line) in lines.iter().enumerate() {
            let mut rest = *line;
            while let Some((before, heading)) = split_fused(rest) {
                trace!(line = idx + 1, "repairing fused separator");
                if !before.is_empty() {
                    out.push(before);
                    out.push("");
                }
                out.push("---");
                out.push("");
                rest = heading;
            }

            let next_is_heading = lines
                .get(idx + 1)
                .is_some_and(|next| matches!(classify(next), Line::SectionHeading { .. }));
            match trailing_rule(rest) {
                Some(before) if next_is_heading => {
                    trace!(line = idx + 1, "repairing trailing fused separator");
                    out.push(before);
                    out.push("");
                    out.push("---");
                    out.push("");
                }
                _ => out.push(rest),
            }
        }
        out.join("\n")
    }

    /// Find `---` immediately followed by a level-2 heading inside one line.
    fn split_fused(line: &str) -> Option<(&str, &str)> {
        let mut search = 0;
        while let Some(rel) = line[search..].find("##") {
            let at = search + rel;
            let level2 = !line[at + 2..].starts_with('#') && !line[..at].ends_with('#');
            let before = line[..at].trim_end_matches([' ', '\t']);
            let dashes = before.len() - before.trim_end_matches('-').len();
            if level2 && dashes >= 3 {
                return Some((before[..before.len() - dashes].trim_end(), &line[at..]));
            }
            search = at + 2;
        }
        None
    }

    /// Text before a trailing `---` glued onto a non-rule line.
    fn trailing_rule(line: &str) -> Option<&str> {
        let trimmed = line.trim_end();
        let before = trimmed.trim_end_matches('-');
        let dashes = trimmed.len() - before.len();
        if dashes < 3 || before.trim().is_empty() || before.ends_with('|') {
            return None;
        }
        Some(before.trim_end())
    }

    /* ------------------------------- Sections ------------------------------- */

    fn table_of_contents(block: &[&str]) -> String {
        let rule = block
            .iter()
            .skip(1)
            .position(|line| classify(line) == Line::Rule)
            .map(|p| p + 1)
            .unwrap_or(block.len());
        let mut toc = join_span(&block[..rule]);
        let leftover: Vec<&str> = block[rule..]
            .iter()
            .copied()
            .filter(|line| !matches!(classify(line), Line::Rule | Line::Blank))
            .collect();
        if !leftover.is_empty() {
            toc.push_str("\n\n");
            toc.push_str(&leftover.join("\n"));
        }
        toc
    }

    /// Detach trailing text after the final rule of the last section, when that section
    /// holds items and the text is not itself an item.
    fn split_footer<'a, 'b>(body: &'b [&'a str]) -> (&'b [&'a str], Option<String>) {
        let Some(rule) = body.iter().rposition(|line| classify(line) == Line::Rule) else {
            return (body, None);
        };
        let is_span_start =
            |line: &&str| matches!(classify(line), Line::ItemHeading { .. } | Line::RangeHeading { .. });
        let tail = &body[rule + 1..];
        if tail.iter().all(|line| line.trim().is_empty())
            || tail.iter().any(is_span_start)
            || !body[..rule].iter().any(is_span_start)
        {
            return (body, None);
        }
        (&body[..=rule], Some(join_span(tail)))
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum SpanKind {
        Item,
        TableGroup,
    }

    fn parse_section_body(body: &[&str], section_index: usize) -> Vec<Item> {
        let lines: Vec<Line<'_>> = body.iter().map(|line| classify(line)).collect();

        let mut starts: Vec<(usize, SpanKind)> = Vec::new();
        for (idx, line) in lines.iter().enumerate() {
            match line {
                Line::ItemHeading { .. } => starts.push((idx, SpanKind::Item)),
                Line::RangeHeading { .. } if table_follows(&lines[idx + 1..]) => {
                    starts.push((idx, SpanKind::TableGroup))
                }
                _ => {}
            }
        }

        let mut items = Vec::new();
        let lead_end = starts.first().map(|(idx, _)| *idx).unwrap_or(body.len());
        let lead = join_span(&body[..lead_end]);
        // A lone rule under an empty section is the separator before the next one.
        let separator_only = starts.is_empty()
            && lines[..lead_end]
                .iter()
                .all(|line| matches!(line, Line::Rule | Line::Blank));
        if !lead.is_empty() && !separator_only {
            if starts.is_empty() {
                trace!(section = section_index, "no items found, keeping section as raw");
            }
            items.push(Item::Raw(RawSection {
                raw_markdown: lead,
                section_index,
            }));
        }

        for (k, &(start, kind)) in starts.iter().enumerate() {
            let end = starts.get(k + 1).map(|(idx, _)| *idx).unwrap_or(body.len());
            let span = join_span(&body[start..end]);
            items.push(match kind {
                SpanKind::Item => Item::Backlog(parse_item(&span, section_index)),
                SpanKind::TableGroup => Item::TableGroup(parse_table_group(&span, section_index)),
            });
        }
        items
    }

    fn table_follows(lines: &[Line<'_>]) -> bool {
        lines
            .iter()
            .take_while(|line| !matches!(line, Line::ItemHeading { .. } | Line::RangeHeading { .. }))
            .any(|line| matches!(line, Line::TableRow(_)))
    }

    /// Join lines with leading blank lines dropped and trailing whitespace trimmed.
    fn join_span(lines: &[&str]) -> String {
        let first = lines
            .iter()
            .position(|line| !line.trim().is_empty())
            .unwrap_or(lines.len());
        lines[first..].join("\n").trim_end().to_string()
    }

    /* ------------------------------ Item fields ------------------------------ */

    fn apply_label_value(item: &mut BacklogItem, field: Field, value: &str) {
        let value = value.trim();
        let text = (!value.is_empty()).then(|| value.to_string());
        match field {
            Field::Component => item.component = text,
            Field::Module => item.module = text,
            Field::Severity => item.severity = severity_code(value),
            Field::Priority => item.priority = text,
            Field::Effort => item.effort = effort_code(value),
            Field::Description => item.description = Some(value.to_string()),
            Field::UserStory => {
                if text.is_some() {
                    item.user_story = text;
                }
            }
            Field::Criteria
            | Field::Specs
            | Field::Reproduction
            | Field::Screens
            | Field::Dependencies
            | Field::Constraints
            | Field::Screenshots => {}
        }
    }

    /// Description text runs across paragraphs and lists until the next label, rule,
    /// heading or table.
    fn continues_description(line: &Line<'_>) -> bool {
        matches!(
            line,
            Line::Blank
                | Line::Other(_)
                | Line::Bullet(_)
                | Line::Numbered(_)
                | Line::Quote(_)
                | Line::Image { .. }
        )
    }

    fn list_field(item: &mut BacklogItem, field: Field) -> Option<&mut Vec<String>> {
        match field {
            Field::Specs => Some(&mut item.specs),
            Field::Reproduction => Some(&mut item.reproduction),
            Field::Screens => Some(&mut item.screens),
            Field::Dependencies => Some(&mut item.dependencies),
            Field::Constraints => Some(&mut item.constraints),
            _ => None,
        }
    }

    /// `P1 - Haute` becomes `P1`; values without a code are kept as written.
    pub(crate) fn severity_code(value: &str) -> Option<String> {
        let value = value.trim();
        let code = value
            .split(|c: char| !c.is_ascii_alphanumeric())
            .find(|token| {
                let bytes = token.as_bytes();
                bytes.len() == 2
                    && bytes[0].eq_ignore_ascii_case(&b'P')
                    && (b'0'..=b'4').contains(&bytes[1])
            })
            .map(str::to_ascii_uppercase);
        code.or_else(|| (!value.is_empty()).then(|| value.to_string()))
    }

    /// `M (2-3 jours)` becomes `M`; values without a size code are kept as written.
    pub(crate) fn effort_code(value: &str) -> Option<String> {
        let value = value.trim();
        let code = value
            .split(|c: char| !c.is_ascii_alphanumeric())
            .find(|token| !token.is_empty())
            .map(str::to_ascii_uppercase)
            .filter(|token| vocab::EFFORT_CODES.contains(&token.as_str()));
        code.or_else(|| (!value.is_empty()).then(|| value.to_string()))
    }

    fn file_name(path: &str) -> &str {
        path.rsplit(['/', '\\']).next().unwrap_or(path)
    }

    fn is_pictographic(c: char) -> bool {
        matches!(
            c as u32,
            0x1F000..=0x1FAFF | 0x2600..=0x27BF | 0x2300..=0x23FF | 0x2B00..=0x2BFF | 0x3030 | 0x303D
        )
    }

    fn is_emoji_joiner(c: char) -> bool {
        matches!(c as u32, 0x200D | 0xFE0E | 0xFE0F | 0x20E3 | 0xE0020..=0xE007F)
    }

    /// Split a leading pictographic token off a title.
    fn split_emoji(title: &str) -> (Option<String>, String) {
        let title = title.trim();
        if !title.chars().next().is_some_and(is_pictographic) {
            return (None, title.to_string());
        }
        let end = title
            .char_indices()
            .find(|(_, c)| !is_pictographic(*c) && !is_emoji_joiner(*c))
            .map(|(idx, _)| idx)
            .unwrap_or(title.len());
        (
            Some(title[..end].to_string()),
            title[end..].trim().to_string(),
        )
    }

}

pub mod builder {
    //! Canonical Markdown for an item. Every place that needs "what a valid item looks
    //! like" (new items, rebuilt items, clipboard export, section templates) goes through
    //! [`build_item_markdown`].

    use crate::core::*;
    use crate::vocab::{self, Field};

    /// Screenshots live under this directory, relative to the backlog file.
    pub const SCREENSHOTS_DIR: &str = "screenshots";

    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct BuildOptions {
        /// Emit absolute screenshot paths rooted here (clipboard export).
        pub base_path: Option<String>,
    }

    pub fn build_item_markdown(item: &BacklogItem, options: &BuildOptions) -> String {
        let mut buf = String::new();

        let mut headline = format!("### {} | ", item.id);
        if let Some(emoji) = item.emoji.as_deref().filter(|e| !e.is_empty()) {
            headline.push_str(emoji);
            headline.push(' ');
        }
        headline.push_str(&item.title);
        buf.push_str(headline.trim_end());
        buf.push('\n');

        let severity = item
            .severity
            .as_deref()
            .map(|code| vocab::severity_label(code).unwrap_or(code));
        push_meta(&mut buf, Field::Component, item.component.as_deref());
        push_meta(&mut buf, Field::Module, item.module.as_deref());
        push_meta(&mut buf, Field::Severity, severity);
        push_meta(&mut buf, Field::Priority, item.priority.as_deref());
        push_meta(&mut buf, Field::Effort, item.effort.as_deref());
        push_meta(&mut buf, Field::Description, item.description.as_deref());

        if let Some(story) = item.user_story.as_deref().filter(|s| !s.trim().is_empty()) {
            push_label(&mut buf, Field::UserStory);
            for line in story.lines() {
                buf.push_str("> ");
                buf.push_str(line);
                buf.push('\n');
            }
        }

        push_list(&mut buf, Field::Reproduction, &item.reproduction, true);
        push_list(&mut buf, Field::Specs, &item.specs, false);
        push_list(&mut buf, Field::Screens, &item.screens, true);

        if !item.criteria.is_empty() {
            push_label(&mut buf, Field::Criteria);
            for criterion in &item.criteria {
                let line = format!(
                    "- [{}] {}",
                    if criterion.checked { 'x' } else { ' ' },
                    criterion.text
                );
                buf.push_str(line.trim_end());
                buf.push('\n');
            }
        }

        push_list(&mut buf, Field::Dependencies, &item.dependencies, false);
        push_list(&mut buf, Field::Constraints, &item.constraints, false);

        if !item.screenshots.is_empty() {
            push_label(&mut buf, Field::Screenshots);
            for shot in &item.screenshots {
                buf.push_str(&format!(
                    "![{}]({})\n",
                    shot.alt.as_deref().unwrap_or_default(),
                    screenshot_path(&shot.filename, options)
                ));
            }
        }

        buf.push_str("\n---\n");
        buf
    }

    /// Heading plus one placeholder item for a new section hosting `type_code`.
    pub fn build_section_template(number: usize, type_code: &str) -> String {
        let code = type_code.trim().to_uppercase();
        let placeholder = BacklogItem::new(&format!("{code}-001"), "Nouvel élément");
        format!(
            "## {}. {}\n\n{}",
            number,
            vocab::type_section_title(&code),
            build_item_markdown(&placeholder, &BuildOptions::default())
        )
    }

    /// Items rebuilt back to back, for pasting elsewhere.
    pub fn export_items_markdown(items: &[&BacklogItem], options: &BuildOptions) -> String {
        items
            .iter()
            .map(|item| build_item_markdown(item, options))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn push_meta(buf: &mut String, field: Field, value: Option<&str>) {
        let Some(value) = value.filter(|v| !v.trim().is_empty()) else {
            return;
        };
        buf.push_str(&format!("**{}:** {}\n", field.label(), value));
    }

    fn push_label(buf: &mut String, field: Field) {
        buf.push('\n');
        buf.push_str(&format!("**{}:**\n", field.label()));
    }

    fn push_list(buf: &mut String, field: Field, entries: &[String], numbered: bool) {
        if entries.is_empty() {
            return;
        }
        push_label(buf, field);
        for (idx, entry) in entries.iter().enumerate() {
            if numbered {
                buf.push_str(&format!("{}. {}\n", idx + 1, entry));
            } else {
                buf.push_str(&format!("- {}\n", entry));
            }
        }
    }

    fn screenshot_path(filename: &str, options: &BuildOptions) -> String {
        match options.base_path.as_deref() {
            Some(base) => format!(
                "{}/{}/{}",
                base.trim_end_matches(['/', '\\']),
                SCREENSHOTS_DIR,
                filename
            ),
            None => format!("{}/{}", SCREENSHOTS_DIR, filename),
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::parser::parse_item;

        fn full_item() -> BacklogItem {
            BacklogItem {
                emoji: Some("🐛".into()),
                component: Some("Launcher".into()),
                severity: Some("P1".into()),
                effort: Some("M".into()),
                description: Some("Plante au démarrage".into()),
                user_story: Some("En tant qu'utilisateur".into()),
                reproduction: vec!["Vider le cache".into(), "Lancer".into()],
                specs: vec!["Log clair".into()],
                criteria: vec![
                    Criterion {
                        text: "Pas de crash".into(),
                        checked: false,
                    },
                    Criterion {
                        text: "Log".into(),
                        checked: true,
                    },
                ],
                dependencies: vec!["FEAT-002".into()],
                screenshots: vec![Screenshot {
                    filename: "crash.png".into(),
                    alt: Some("Crash".into()),
                }],
                ..BacklogItem::new("BUG-001", "Crash")
            }
        }

        #[test]
        fn emits_fields_in_canonical_order() {
            let text = build_item_markdown(&full_item(), &BuildOptions::default());
            let expected = "### BUG-001 | 🐛 Crash
**Composant:** Launcher
**Sévérité:** P1 - Haute
**Effort:** M
**Description:** Plante au démarrage

**User Story:**
> En tant qu'utilisateur

**Reproduction:**
1. Vider le cache
2. Lancer

**Spécifications:**
- Log clair

**Critères d'acceptation:**
- [ ] Pas de crash
- [x] Log

**Dépendances:**
- FEAT-002

**Screenshots:**
![Crash](screenshots/crash.png)

---
";
            assert_eq!(text, expected);
        }

        #[test]
        fn omits_empty_fields() {
            let text = build_item_markdown(
                &BacklogItem::new("FEAT-003", "Export"),
                &BuildOptions::default(),
            );
            assert_eq!(text, "### FEAT-003 | Export\n\n---\n");
        }

        #[test]
        fn base_path_makes_screenshots_absolute() {
            let options = BuildOptions {
                base_path: Some("/home/me/project/".into()),
            };
            let text = build_item_markdown(&full_item(), &options);
            assert!(text.contains("![Crash](/home/me/project/screenshots/crash.png)"));
        }

        #[test]
        fn built_text_parses_back() {
            let original = full_item();
            let text = build_item_markdown(&original, &BuildOptions::default());
            let parsed = parse_item(text.trim_end(), 0);
            assert_eq!(parsed.id, original.id);
            assert_eq!(parsed.emoji, original.emoji);
            assert_eq!(parsed.title, original.title);
            assert_eq!(parsed.severity, original.severity);
            assert_eq!(parsed.effort, original.effort);
            assert_eq!(parsed.description, original.description);
            assert_eq!(parsed.user_story, original.user_story);
            assert_eq!(parsed.reproduction, original.reproduction);
            assert_eq!(parsed.specs, original.specs);
            assert_eq!(parsed.criteria, original.criteria);
            assert_eq!(parsed.dependencies, original.dependencies);
            assert_eq!(parsed.screenshots, original.screenshots);
        }

        #[test]
        fn export_joins_items_with_a_blank_line() {
            let a = BacklogItem::new("FEAT-001", "Export");
            let b = BacklogItem::new("FEAT-002", "Import");
            assert_eq!(
                export_items_markdown(&[&a, &b], &BuildOptions::default()),
                "### FEAT-001 | Export\n\n---\n\n### FEAT-002 | Import\n\n---\n"
            );
            assert_eq!(export_items_markdown(&[], &BuildOptions::default()), "");
        }

        #[test]
        fn multi_paragraph_description_parses_back() {
            let item = BacklogItem {
                description: Some("Contexte.\n\nÉtapes:\n1. ouvrir\n2. fermer\n\n> note".into()),
                ..full_item()
            };
            let text = build_item_markdown(&item, &BuildOptions::default());
            let parsed = parse_item(text.trim_end(), 0);
            assert_eq!(parsed.description, item.description);
            assert_eq!(parsed.user_story, item.user_story);
            assert_eq!(parsed.reproduction, item.reproduction);
        }

        #[test]
        fn section_template_uses_type_title() {
            let text = build_section_template(3, "bug");
            assert!(text.starts_with("## 3. BUGS\n\n### BUG-001 | Nouvel élément\n"));
        }
    }
}

pub mod format {
    use crate::builder::{BuildOptions, build_item_markdown};
    use crate::classify::{Line, classify};
    use crate::core::*;
    use std::borrow::Cow;

    /// Format a backlog back to text. Items are copied from their source span unless
    /// they were modified, in which case they are rebuilt.
    pub fn format_backlog(backlog: &Backlog) -> String {
        let mut out = String::new();

        if !backlog.header.trim().is_empty() {
            out.push_str(backlog.header.trim_end());
            out.push_str("\n\n");
        }

        let toc = strip_trailing_rules(&backlog.table_of_contents);
        if !toc.is_empty() {
            out.push_str(toc);
            out.push_str("\n\n---\n\n");
        }

        for (idx, section) in backlog.sections.iter().enumerate() {
            if idx > 0 && !ends_with_rule(&out) {
                out.push_str("---\n\n");
            }
            out.push_str(section.raw_header.trim_end());
            out.push_str("\n\n");
            for item in &section.items {
                let text = item_text(item);
                let text = text.trim_end();
                if text.is_empty() {
                    continue;
                }
                out.push_str(text);
                out.push_str("\n\n");
            }
        }

        if let Some(footer) = backlog.footer.as_deref().filter(|f| !f.trim().is_empty()) {
            if !ends_with_rule(&out) {
                out.push_str("---\n\n");
            }
            out.push_str(footer.trim_end());
        }

        let mut out = out.trim_end().to_string();
        out.push('\n');
        out
    }

    fn item_text(item: &Item) -> Cow<'_, str> {
        match item {
            Item::Backlog(it) if it.modified => {
                Cow::Owned(build_item_markdown(it, &BuildOptions::default()))
            }
            Item::Backlog(it) => Cow::Borrowed(&it.raw_markdown),
            Item::TableGroup(group) => Cow::Borrowed(&group.raw_markdown),
            Item::Raw(raw) => Cow::Borrowed(&raw.raw_markdown),
        }
    }

    fn ends_with_rule(text: &str) -> bool {
        text.lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .is_some_and(|line| classify(line) == Line::Rule)
    }

    fn strip_trailing_rules(text: &str) -> &str {
        let mut text = text.trim_end();
        while let Some((rest, last)) = text.rsplit_once('\n') {
            if classify(last) != Line::Rule {
                break;
            }
            text = rest.trim_end();
        }
        if classify(text) == Line::Rule {
            return "";
        }
        text
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::edit::{ItemUpdate, toggle_criterion, update_item};
        use crate::parser::parse_backlog;
        use crate::query::all_items;
        use proptest::prelude::*;

        const CANONICAL: &str = r#"# Backlog

## Table des matières

1. [BUGS](#1-bugs)
2. [FEATURES](#2-features)

---

## 1. BUGS

### BUG-001 | 🐛 Crash
**Sévérité:** P1 - Haute
**Description:** Plante

**Critères d'acceptation:**
- [ ] Pas de crash

---

### BUG-005 à 006 | Mineurs

| ID | Description | Action |
|----|-------------|--------|
| BUG-005 | Typo | Corriger |
| BUG-006 | Marge | Ajuster |

---

## 2. FEATURES

<!-- notes libres -->

### FEAT-001 | Export
**Effort:**   L   (custom spacing kept)

---

*Fin du document*
"#;

        #[test]
        fn formatter_round_trips_original_text() {
            let backlog = parse_backlog(CANONICAL);
            assert_eq!(format_backlog(&backlog), CANONICAL);
        }

        #[test]
        fn formatter_rebuilds_only_modified_items() {
            let mut backlog = parse_backlog(CANONICAL);
            let feat = backlog.item("FEAT-001").expect("FEAT-001").clone();
            let updated = update_item(
                &feat,
                &ItemUpdate {
                    title: Some("Export PDF".into()),
                    ..ItemUpdate::default()
                },
            );
            assert!(backlog.replace_item(updated));

            let text = format_backlog(&backlog);
            assert!(text.contains("### FEAT-001 | Export PDF\n**Effort:** L\n\n---"));
            // Untouched items keep their source text byte for byte.
            assert!(text.contains("### BUG-001 | 🐛 Crash\n**Sévérité:** P1 - Haute\n"));
            assert!(text.contains("<!-- notes libres -->"));
            assert!(text.ends_with("---\n\n*Fin du document*\n"));
            assert!(!text.contains("---\n\n---"));
        }

        #[test]
        fn multi_paragraph_description_survives_a_save() {
            let mut backlog = parse_backlog(CANONICAL);
            let feat = backlog.item("FEAT-001").expect("FEAT-001").clone();
            let description = "Premier paragraphe.\n\nSecond paragraphe:\n- point a\n- point b";
            let updated = update_item(
                &feat,
                &ItemUpdate {
                    description: Some(description.into()),
                    ..ItemUpdate::default()
                },
            );
            assert!(backlog.replace_item(updated));

            let reparsed = parse_backlog(&format_backlog(&backlog));
            let feat = reparsed.item("FEAT-001").expect("FEAT-001");
            assert_eq!(feat.description.as_deref(), Some(description));
            assert_eq!(feat.effort.as_deref(), Some("L"));
            assert_eq!(reparsed.footer.as_deref(), Some("*Fin du document*"));
        }

        #[test]
        fn toggled_item_survives_a_save() {
            let mut backlog = parse_backlog(CANONICAL);
            let bug = backlog.item("BUG-001").expect("BUG-001").clone();
            assert!(backlog.replace_item(toggle_criterion(&bug, 0)));
            let reparsed = parse_backlog(&format_backlog(&backlog));
            let bug = reparsed.item("BUG-001").expect("BUG-001");
            assert!(bug.criteria[0].checked);
            assert!(!bug.modified);
        }

        #[test]
        fn sections_get_one_separator() {
            let backlog = parse_backlog("## 1. A\n\ntexte\n\n## 2. B\n\nautre\n");
            assert_eq!(
                format_backlog(&backlog),
                "## 1. A\n\ntexte\n\n---\n\n## 2. B\n\nautre\n"
            );
        }

        #[test]
        fn toc_trailing_rule_is_not_doubled() {
            let backlog = Backlog {
                table_of_contents: "## Sommaire\n\n1. [A](#1-a)\n\n---".into(),
                ..Backlog::default()
            };
            assert_eq!(format_backlog(&backlog), "## Sommaire\n\n1. [A](#1-a)\n\n---\n");
        }

        #[test]
        fn empty_backlog_is_a_newline() {
            assert_eq!(format_backlog(&Backlog::default()), "\n");
        }

        #[test]
        fn inserted_and_removed_items() {
            let mut backlog = parse_backlog(CANONICAL);
            assert!(backlog.insert_item(1, BacklogItem::new("FEAT-002", "Import")));
            assert!(!backlog.insert_item(9, BacklogItem::new("FEAT-003", "Perdu")));
            let removed = backlog.remove_item("BUG-001").expect("BUG-001");
            assert_eq!(removed.title, "Crash");
            assert!(backlog.remove_item("BUG-404").is_none());

            let text = format_backlog(&backlog);
            assert!(!text.contains("### BUG-001"));
            assert!(text.contains("## 1. BUGS\n\n### BUG-005 à 006 | Mineurs\n"));
            assert!(text.ends_with(
                "(custom spacing kept)\n\n---\n\n### FEAT-002 | Import\n\n---\n\n*Fin du document*\n"
            ));
        }

        fn description_strategy() -> impl Strategy<Value = String> {
            (
                prop::collection::vec("[a-z]{1,8}( [a-z]{1,8}){0,5}", 1..3),
                prop::collection::vec("[a-z]{1,8}( [a-z]{1,8}){0,2}", 0..3),
            )
                .prop_map(|(paragraphs, points)| {
                    let mut text = paragraphs.join("\n\n");
                    for point in points {
                        text.push_str("\n- ");
                        text.push_str(&point);
                    }
                    text
                })
        }

        fn item_strategy() -> impl Strategy<Value = (String, String, Vec<(String, bool)>)> {
            (
                "[A-Z][a-z]{1,8}( [a-z]{1,8}){0,3}",
                description_strategy(),
                prop::collection::vec(("[a-z]{1,8}( [a-z]{1,8}){0,3}", any::<bool>()), 0..4),
            )
        }

        fn backlog_markdown(
            items: &[(String, String, Vec<(String, bool)>)],
            severity: Option<u8>,
        ) -> String {
            let mut md = String::from("# Backlog\n\n## 1. BUGS\n\n");
            for (n, (title, description, criteria)) in items.iter().enumerate() {
                let mut item = BacklogItem::new(&format!("BUG-{:03}", n + 1), title);
                item.description = Some(description.clone());
                item.severity = severity.map(|s| format!("P{s}"));
                item.criteria = criteria
                    .iter()
                    .map(|(text, checked)| Criterion { text: text.clone(), checked: *checked })
                    .collect();
                md.push_str(&build_item_markdown(&item, &BuildOptions::default()));
                md.push('\n');
            }
            md
        }

        proptest! {
            #[test]
            fn parse_format_parse_is_stable(
                items in prop::collection::vec(item_strategy(), 1..6),
                severity in prop::option::of(0u8..5),
            ) {
                let first = parse_backlog(&backlog_markdown(&items, severity));
                let second = parse_backlog(&format_backlog(&first));
                let (a, b) = (all_items(&first), all_items(&second));
                prop_assert_eq!(a.len(), items.len());
                prop_assert_eq!(a.len(), b.len());
                for ((x, y), (_, description, _)) in a.iter().zip(b.iter()).zip(items.iter()) {
                    prop_assert_eq!(x.description.as_deref(), Some(description.as_str()));
                    prop_assert_eq!(&x.id, &y.id);
                    prop_assert_eq!(&x.item_type, &y.item_type);
                    prop_assert_eq!(&x.title, &y.title);
                    prop_assert_eq!(&x.description, &y.description);
                    prop_assert_eq!(&x.severity, &y.severity);
                    prop_assert_eq!(x.criteria.len(), y.criteria.len());
                }
            }

            #[test]
            fn edited_items_parse_back(
                items in prop::collection::vec(item_strategy(), 1..6),
                severity in prop::option::of(0u8..5),
                edits in prop::collection::vec(
                    (prop::option::of(description_strategy()), prop::option::of(0u8..5), any::<bool>()),
                    6,
                ),
            ) {
                let mut backlog = parse_backlog(&backlog_markdown(&items, severity));
                let originals: Vec<BacklogItem> = all_items(&backlog).into_iter().cloned().collect();

                let mut expected = Vec::new();
                for (item, (description, new_severity, toggle)) in originals.iter().zip(edits.iter()) {
                    let mut edited = update_item(
                        item,
                        &ItemUpdate {
                            description: description.clone(),
                            severity: new_severity.map(|s| format!("P{s}")),
                            ..ItemUpdate::default()
                        },
                    );
                    if *toggle {
                        edited = toggle_criterion(&edited, 0);
                    }
                    prop_assert!(backlog.replace_item(edited.clone()));
                    expected.push(edited);
                }

                let reparsed = parse_backlog(&format_backlog(&backlog));
                let actual = all_items(&reparsed);
                prop_assert_eq!(actual.len(), expected.len());
                for (x, y) in expected.iter().zip(actual.iter()) {
                    prop_assert_eq!(&x.id, &y.id);
                    prop_assert_eq!(&x.item_type, &y.item_type);
                    prop_assert_eq!(&x.title, &y.title);
                    prop_assert_eq!(&x.description, &y.description);
                    prop_assert_eq!(&x.severity, &y.severity);
                    prop_assert_eq!(&x.criteria, &y.criteria);
                }
            }
        }
    }
}

pub mod edit {
    //! Item mutations. Each returns a new item and leaves its input untouched.

    use crate::classify::checkbox_mark_offset;
    use crate::core::*;
    use crate::parser::{effort_code, severity_code};
    use serde::{Deserialize, Serialize};

    /// Partial update for a backlog item. `None` keeps the current value; an empty
    /// string clears an optional field.
    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct ItemUpdate {
        pub title: Option<String>,
        pub emoji: Option<String>,
        pub component: Option<String>,
        pub module: Option<String>,
        pub severity: Option<String>,
        pub priority: Option<String>,
        pub effort: Option<String>,
        pub description: Option<String>,
        pub user_story: Option<String>,
        pub specs: Option<Vec<String>>,
        pub reproduction: Option<Vec<String>>,
        pub screens: Option<Vec<String>>,
        pub criteria: Option<Vec<Criterion>>,
        pub dependencies: Option<Vec<String>>,
        pub constraints: Option<Vec<String>>,
        pub screenshots: Option<Vec<Screenshot>>,
    }

    /// Merge `updates` into a copy of `item`. Identity fields and the source span are kept;
    /// the copy is flagged so the formatter rebuilds it.
    pub fn update_item(item: &BacklogItem, updates: &ItemUpdate) -> BacklogItem {
        let mut next = item.clone();

        if let Some(title) = &updates.title {
            next.title = title.trim().to_string();
        }
        merge_optional(&mut next.emoji, &updates.emoji);
        merge_optional(&mut next.component, &updates.component);
        merge_optional(&mut next.module, &updates.module);
        merge_optional(&mut next.priority, &updates.priority);
        merge_optional(&mut next.description, &updates.description);
        merge_optional(&mut next.user_story, &updates.user_story);
        if let Some(severity) = &updates.severity {
            next.severity = severity_code(severity);
        }
        if let Some(effort) = &updates.effort {
            next.effort = effort_code(effort);
        }

        merge_list(&mut next.specs, &updates.specs);
        merge_list(&mut next.reproduction, &updates.reproduction);
        merge_list(&mut next.screens, &updates.screens);
        merge_list(&mut next.criteria, &updates.criteria);
        merge_list(&mut next.dependencies, &updates.dependencies);
        merge_list(&mut next.constraints, &updates.constraints);
        merge_list(&mut next.screenshots, &updates.screenshots);

        next.modified = true;
        next
    }

    /// Flip criterion `index`, patching only its bracket character in `raw_markdown`.
    /// An out-of-range index returns the item unchanged.
    pub fn toggle_criterion(item: &BacklogItem, index: usize) -> BacklogItem {
        let Some(criterion) = item.criteria.get(index) else {
            return item.clone();
        };
        let checked = !criterion.checked;

        let mut next = item.clone();
        next.criteria[index].checked = checked;
        next.raw_markdown = patch_checkbox(&item.raw_markdown, index, checked);
        next.modified = true;
        next
    }

    fn patch_checkbox(raw: &str, index: usize, checked: bool) -> String {
        let mut out = String::with_capacity(raw.len());
        let mut seen = 0;
        for line in raw.split_inclusive('\n') {
            match checkbox_mark_offset(line) {
                Some(offset) if seen == index => {
                    out.push_str(&line[..offset]);
                    out.push(if checked { 'x' } else { ' ' });
                    out.push_str(&line[offset + 1..]);
                    seen += 1;
                }
                Some(_) => {
                    out.push_str(line);
                    seen += 1;
                }
                None => out.push_str(line),
            }
        }
        out
    }

    fn merge_optional(slot: &mut Option<String>, update: &Option<String>) {
        if let Some(value) = update {
            let value = value.trim();
            *slot = (!value.is_empty()).then(|| value.to_string());
        }
    }

    fn merge_list<T: Clone>(slot: &mut Vec<T>, update: &Option<Vec<T>>) {
        if let Some(values) = update {
            *slot = values.clone();
        }
    }

}

pub mod query {
    //! Read-side helpers over a parsed backlog.

    use crate::classify::{Line, classify, split_item_id, table_cells};
    use crate::core::*;
    use indexmap::IndexSet;
    use std::collections::HashSet;

    /// Backlog items in document order, first occurrence of each id only.
    pub fn all_items(backlog: &Backlog) -> Vec<&BacklogItem> {
        let mut seen = HashSet::new();
        backlog
            .sections
            .iter()
            .flat_map(|section| section.backlog_items())
            .filter(|item| seen.insert(item.id.as_str()))
            .collect()
    }

    pub fn items_by_type<'a>(backlog: &'a Backlog, item_type: &str) -> Vec<&'a BacklogItem> {
        all_items(backlog)
            .into_iter()
            .filter(|item| item.item_type == item_type)
            .collect()
    }

    /// Type code of a strict `LETTERS-DIGITS` id.
    pub fn type_from_id(id: &str) -> Option<String> {
        split_item_id(id).map(|(letters, _)| letters.to_string())
    }

    pub fn require_type_from_id(id: &str) -> Result<String, BacklogError> {
        type_from_id(id).ok_or_else(|| BacklogError::InvalidId(id.to_string()))
    }

    /// Type codes of every item heading, range heading, and table row id, in first-seen order.
    pub fn detect_types_from_markdown(markdown: &str) -> IndexSet<String> {
        let mut types = IndexSet::new();
        for line in markdown.lines() {
            let id = match classify(line) {
                Line::ItemHeading { id, .. } => id,
                Line::RangeHeading { range, .. } => range.split_whitespace().next().unwrap_or_default(),
                Line::TableRow(row) => table_cells(row)
                    .first()
                    .copied()
                    .map(|cell| cell.trim_matches(|c| c == '*' || c == '`'))
                    .unwrap_or_default(),
                _ => continue,
            };
            let id = id.split(['à', '–', '—']).next().unwrap_or_default().trim();
            if let Some(code) = type_from_id(id) {
                types.insert(code);
            }
        }
        types
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::parser::parse_backlog;

        const DOC: &str = "## 1. BUGS\n\n### BUG-001 | A\n\n---\n\n### BUG-002 | B\n\n---\n\n## 2. FEATURES\n\n### FEAT-001 | C\n\n---\n\n### BUG-001 | Doublon\n\n---\n\n## 3. MINEURS\n\n### EXT-010 à 012 | Lot\n\n| ID | Desc | Action |\n|---|---|---|\n| EXT-010 | x | y |\n| ADM-001 | x | y |\n";

        #[test]
        fn duplicates_keep_first_occurrence() {
            let backlog = parse_backlog(DOC);
            let items = all_items(&backlog);
            let ids: Vec<&str> = items.iter().map(|i| i.id.as_str()).collect();
            assert_eq!(ids, ["BUG-001", "BUG-002", "FEAT-001"]);
            assert_eq!(items[0].title, "A");
        }

        #[test]
        fn filters_by_type() {
            let backlog = parse_backlog(DOC);
            let bugs = items_by_type(&backlog, "BUG");
            assert_eq!(bugs.len(), 2);
            assert!(items_by_type(&backlog, "DOC").is_empty());
        }

        #[test]
        fn type_from_id_is_strict() {
            assert_eq!(type_from_id("BUG-001").as_deref(), Some("BUG"));
            assert_eq!(type_from_id("bug-001"), None);
            assert_eq!(type_from_id("BUG001"), None);
            assert_eq!(type_from_id("001"), None);
            assert_eq!(type_from_id(""), None);
            assert!(matches!(
                require_type_from_id("nope"),
                Err(BacklogError::InvalidId(id)) if id == "nope"
            ));
        }

        #[test]
        fn detects_types_in_order() {
            let types: Vec<String> = detect_types_from_markdown(DOC).into_iter().collect();
            assert_eq!(types, ["BUG", "FEAT", "EXT", "ADM"]);
        }
    }
}

pub mod surgery {
    //! Whole-section edits on raw text. These touch the table of contents, which lives
    //! outside the parsed section tree, so they work on lines rather than on a `Backlog`.

    use crate::builder::build_section_template;
    use crate::classify::{Line, classify};
    use crate::vocab;
    use tracing::debug;
    use unicode_normalization::{UnicodeNormalization, char::is_combining_mark};

    #[derive(Debug, Clone, Copy)]
    struct Heading<'a> {
        line: usize,
        number: Option<&'a str>,
        title: &'a str,
    }

    fn section_headings<'a>(lines: &[&'a str]) -> Vec<Heading<'a>> {
        lines
            .iter()
            .enumerate()
            .filter_map(|(line, text)| match classify(text) {
                Line::SectionHeading { number, title } => Some(Heading {
                    line,
                    number,
                    title,
                }),
                _ => None,
            })
            .collect()
    }

    /// Remove the first section hosting `type_id`, renumber the remaining numbered
    /// sections when the removed one was numbered, and rebuild the table of contents.
    /// Text without a matching section is returned unchanged.
    pub fn remove_section_from_markdown(markdown: &str, type_id: &str) -> String {
        with_lf(markdown, |text| {
            let lines: Vec<&str> = text.split('\n').collect();
            let headings = section_headings(&lines);
            let candidates = vocab::type_labels(type_id);

            let Some(pos) = headings
                .iter()
                .position(|h| !vocab::is_toc_title(h.title) && matches_type(h.title, &candidates))
            else {
                debug!(type_id, "no section to remove");
                return None;
            };
            let target = headings[pos];
            let end = headings
                .get(pos + 1)
                .map(|h| h.line)
                .unwrap_or(lines.len());
            debug!(type_id, title = target.title, "removing section");

            let mut kept: Vec<String> = lines[..target.line]
                .iter()
                .chain(&lines[end..])
                .map(|line| line.to_string())
                .collect();
            if end == lines.len() {
                trim_trailing_blank(&mut kept);
            }
            if target.number.is_some() {
                renumber_sections(&mut kept);
            }
            Some(regenerate_toc(&kept.join("\n")))
        })
    }

    /// Append a numbered section for `type_id` built from the section template, then
    /// rebuild the table of contents. Text that already hosts the type is returned unchanged.
    pub fn append_section_to_markdown(markdown: &str, type_id: &str) -> String {
        with_lf(markdown, |text| {
            let lines: Vec<&str> = text.split('\n').collect();
            let headings = section_headings(&lines);
            let candidates = vocab::type_labels(type_id);
            if headings
                .iter()
                .any(|h| !vocab::is_toc_title(h.title) && matches_type(h.title, &candidates))
            {
                debug!(type_id, "section already present");
                return None;
            }

            let number = headings
                .iter()
                .filter(|h| h.number.is_some() && !vocab::is_toc_title(h.title))
                .count()
                + 1;
            let mut out = text.trim_end().to_string();
            if !out.is_empty() {
                let ends_with_rule = out
                    .lines()
                    .next_back()
                    .is_some_and(|line| classify(line) == Line::Rule);
                out.push_str(if ends_with_rule { "\n\n" } else { "\n\n---\n\n" });
            }
            out.push_str(&build_section_template(number, type_id));
            debug!(type_id, number, "appended section");
            Some(regenerate_toc(&out))
        })
    }

    /// Replace the body of the table of contents with one link per numbered section.
    /// Text without a contents heading is returned unchanged.
    pub fn regenerate_toc(markdown: &str) -> String {
        let lines: Vec<&str> = markdown.split('\n').collect();
        let headings = section_headings(&lines);
        let Some(toc) = headings.iter().find(|h| vocab::is_toc_title(h.title)) else {
            return markdown.to_string();
        };

        let body_end = lines[toc.line + 1..]
            .iter()
            .position(|line| matches!(classify(line), Line::Rule | Line::SectionHeading { .. }))
            .map(|p| toc.line + 1 + p)
            .unwrap_or(lines.len());

        let mut out: Vec<String> = lines[..=toc.line].iter().map(|l| l.to_string()).collect();
        out.push(String::new());
        for heading in headings.iter().filter(|h| !vocab::is_toc_title(h.title)) {
            if let Some(number) = heading.number {
                out.push(format!(
                    "{number}. [{}](#{number}-{})",
                    heading.title,
                    slugify(heading.title)
                ));
            }
        }
        out.push(String::new());
        if body_end == lines.len() {
            out.push(String::new());
        }
        out.extend(lines[body_end..].iter().map(|l| l.to_string()));
        out.join("\n")
    }

    /// Anchor slug: lowercase, diacritics stripped, `[a-z0-9\s-]` kept, each whitespace
    /// run replaced by one hyphen. Ends are not trimmed: `🐛 Bugs` gives `-bugs`.
    pub fn slugify(title: &str) -> String {
        let mut slug = String::with_capacity(title.len());
        let lowered = title.to_lowercase();
        let kept = lowered
            .nfd()
            .filter(|c| !is_combining_mark(*c))
            .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c.is_whitespace() || *c == '-');
        for c in kept {
            if !c.is_whitespace() {
                slug.push(c);
            } else if !slug.ends_with(' ') {
                slug.push(' ');
            }
        }
        slug.replace(' ', "-")
    }

    /// Rewrite the number of each numbered heading in place, counting from 1.
    fn renumber_sections(lines: &mut [String]) {
        let mut next = 1;
        for line in lines.iter_mut() {
            let digits = match classify(line.as_str()) {
                Line::SectionHeading {
                    number: Some(number),
                    title,
                } if !vocab::is_toc_title(title) => line
                    .find(|c: char| c.is_ascii_digit())
                    .map(|start| start..start + number.len()),
                _ => continue,
            };
            if let Some(digits) = digits {
                line.replace_range(digits, &next.to_string());
            }
            next += 1;
        }
    }

    fn matches_type(title: &str, candidates: &[String]) -> bool {
        let title = title.trim();
        let upper = title.to_uppercase();
        let key = normalize_key(title);
        candidates.iter().any(|candidate| {
            title == candidate
                || upper.starts_with(&candidate.to_uppercase())
                || key == normalize_key(candidate)
        })
    }

    fn normalize_key(text: &str) -> String {
        text.chars()
            .filter(|c| c.is_alphanumeric())
            .flat_map(char::to_uppercase)
            .collect()
    }

    fn trim_trailing_blank(lines: &mut Vec<String>) {
        while lines.last().is_some_and(|l| l.trim().is_empty()) {
            lines.pop();
        }
        lines.push(String::new());
    }

    /// Run a line-based edit on LF text and restore CRLF endings if the input used them.
    /// `None` from the edit means "no change".
    fn with_lf(markdown: &str, edit: impl FnOnce(&str) -> Option<String>) -> String {
        let crlf = markdown.contains("\r\n");
        let text = if crlf {
            markdown.replace("\r\n", "\n")
        } else {
            markdown.to_string()
        };
        match edit(&text) {
            Some(out) if crlf => out.replace('\n', "\r\n"),
            Some(out) => out,
            None => markdown.to_string(),
        }
    }

}

pub use crate::core::{Backlog, BacklogError, BacklogItem, Item};
pub use edit::{ItemUpdate, toggle_criterion, update_item};
pub use format::format_backlog;
pub use parser::{parse_backlog, parse_backlog_file};
