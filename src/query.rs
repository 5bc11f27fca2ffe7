//! Ranked report query composer.
//!
//! A [`RankedQuerySpec`] carries every optional filter for the two report
//! families. [`RankedQuerySpec::build`] turns it into a list of typed
//! [`Predicate`]s anchored on `1 = 1`, renders them with `?` placeholders,
//! and returns the row query together with a count query over the same
//! `DISTINCT` projection so both agree on the number of matches.
//!
//! Free-text filters go through [`glob_to_regex`] and are bound as
//! `REGEXP` parameters. Column names only ever come from closed enums.

use chrono::{Datelike, Utc};

use crate::config::SourcesConfig;
use crate::error::{Error, Result};

/// Years used for the "all time" window.
pub const ALL_TIME_YEARS: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFamily {
    MostViewed,
    MostCited,
}

impl ReportFamily {
    pub fn view(&self) -> &'static str {
        match self {
            ReportFamily::MostViewed => "vw_stat_most_viewed",
            ReportFamily::MostCited => "vw_stat_cited_crosstab_with_details",
        }
    }

    pub fn year_column(&self) -> &'static str {
        match self {
            ReportFamily::MostViewed => "pubyear",
            ReportFamily::MostCited => "year",
        }
    }

    /// Projected columns, in display order.
    pub fn columns(&self) -> &'static [&'static str] {
        match self {
            ReportFamily::MostViewed => &[
                "document_id",
                "hdgauthor",
                "hdgtitle",
                "srctitleseries",
                "source_code",
                "pubyear",
                "vol",
                "issue",
                "pgrg",
                "textref",
                "lastweek",
                "lastmonth",
                "last6months",
                "last12months",
                "lastcalyear",
            ],
            ReportFamily::MostCited => &[
                "document_id",
                "hdgauthor",
                "hdgtitle",
                "srctitleseries",
                "source_code",
                "year",
                "vol",
                "pgrg",
                "textref",
                "count5",
                "count10",
                "count20",
                "countAll",
            ],
        }
    }

    pub fn default_period(&self) -> CountColumn {
        match self {
            ReportFamily::MostViewed => CountColumn::Last12Months,
            ReportFamily::MostCited => CountColumn::CountAll,
        }
    }
}

/// The per-period count columns of both families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountColumn {
    LastCalendarYear,
    LastWeek,
    LastMonth,
    Last6Months,
    Last12Months,
    Count5,
    Count10,
    Count20,
    CountAll,
}

impl CountColumn {
    pub fn name(&self) -> &'static str {
        match self {
            CountColumn::LastCalendarYear => "lastcalyear",
            CountColumn::LastWeek => "lastweek",
            CountColumn::LastMonth => "lastmonth",
            CountColumn::Last6Months => "last6months",
            CountColumn::Last12Months => "last12months",
            CountColumn::Count5 => "count5",
            CountColumn::Count10 => "count10",
            CountColumn::Count20 => "count20",
            CountColumn::CountAll => "countAll",
        }
    }

    pub fn family(&self) -> ReportFamily {
        match self {
            CountColumn::Count5
            | CountColumn::Count10
            | CountColumn::Count20
            | CountColumn::CountAll => ReportFamily::MostCited,
            _ => ReportFamily::MostViewed,
        }
    }

    /// View periods by number: 0 last calendar year, 1 last week,
    /// 2 last month, 3 last six months, 4 last twelve months.
    pub fn view_period(n: u8) -> Option<Self> {
        match n {
            0 => Some(CountColumn::LastCalendarYear),
            1 => Some(CountColumn::LastWeek),
            2 => Some(CountColumn::LastMonth),
            3 => Some(CountColumn::Last6Months),
            4 => Some(CountColumn::Last12Months),
            _ => None,
        }
    }

    /// Citation periods: `5`, `10`, `20` or `all`.
    pub fn cite_period(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "5" => Some(CountColumn::Count5),
            "10" => Some(CountColumn::Count10),
            "20" => Some(CountColumn::Count20),
            "all" | "alltime" => Some(CountColumn::CountAll),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentClass {
    Journals,
    Books,
    Videos,
}

impl ContentClass {
    /// Any non-empty prefix of `journals`, `books` or `videos`.
    /// Anything else (including `all`) is `None`, meaning no restriction.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim().to_ascii_lowercase();
        if s.is_empty() {
            return None;
        }
        [
            ("journals", ContentClass::Journals),
            ("books", ContentClass::Books),
            ("videos", ContentClass::Videos),
        ]
        .into_iter()
        .find(|(name, _)| name.starts_with(s.as_str()))
        .map(|(_, class)| class)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublicationWindow {
    Years(u32),
    AllTime,
}

impl PublicationWindow {
    pub fn parse(s: &str) -> Result<Self> {
        let t = s.trim();
        if t.eq_ignore_ascii_case("all") || t.eq_ignore_ascii_case("alltime") {
            return Ok(PublicationWindow::AllTime);
        }
        t.parse().map(PublicationWindow::Years).map_err(|_| Error::InvalidFilter {
            field: "period",
            value: s.to_string(),
        })
    }

    fn years(&self) -> u32 {
        match self {
            PublicationWindow::Years(n) => *n,
            PublicationWindow::AllTime => ALL_TIME_YEARS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

impl Direction {
    fn sql(&self) -> &'static str {
        match self {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortColumn {
    DocumentId,
    Author,
    Title,
    SourceTitle,
    SourceCode,
    Year,
    Count(CountColumn),
}

impl SortColumn {
    fn name(&self, family: ReportFamily) -> &'static str {
        match self {
            SortColumn::DocumentId => "document_id",
            SortColumn::Author => "hdgauthor",
            SortColumn::Title => "hdgtitle",
            SortColumn::SourceTitle => "srctitleseries",
            SortColumn::SourceCode => "source_code",
            SortColumn::Year => family.year_column(),
            SortColumn::Count(c) => c.name(),
        }
    }

    /// Column by its projected name, e.g. `hdgtitle` or `countAll`.
    pub fn parse(s: &str, family: ReportFamily) -> Result<Self> {
        let col = match s.trim() {
            "document_id" => SortColumn::DocumentId,
            "hdgauthor" | "author" => SortColumn::Author,
            "hdgtitle" | "title" => SortColumn::Title,
            "srctitleseries" | "source" => SortColumn::SourceTitle,
            "source_code" => SortColumn::SourceCode,
            "pubyear" | "year" => SortColumn::Year,
            other => {
                let count = [
                    CountColumn::LastCalendarYear,
                    CountColumn::LastWeek,
                    CountColumn::LastMonth,
                    CountColumn::Last6Months,
                    CountColumn::Last12Months,
                    CountColumn::Count5,
                    CountColumn::Count10,
                    CountColumn::Count20,
                    CountColumn::CountAll,
                ]
                .into_iter()
                .find(|c| c.name().eq_ignore_ascii_case(other) && c.family() == family);
                match count {
                    Some(c) => SortColumn::Count(c),
                    None => {
                        return Err(Error::InvalidFilter {
                            field: "sort",
                            value: s.to_string(),
                        })
                    }
                }
            }
        };
        Ok(col)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Sort {
    /// Descending on the selected period's count column.
    #[default]
    Default,
    None,
    By(SortColumn, Direction),
}

impl Sort {
    /// `none`, `default`, or `column[:asc|:desc]` (descending when omitted).
    pub fn parse(s: &str, family: ReportFamily) -> Result<Self> {
        let t = s.trim();
        if t.eq_ignore_ascii_case("none") {
            return Ok(Sort::None);
        }
        if t.is_empty() || t.eq_ignore_ascii_case("default") {
            return Ok(Sort::Default);
        }
        let (col, dir) = match t.split_once(':') {
            Some((col, dir)) => (col, dir),
            None => (t, "desc"),
        };
        let direction = match dir.trim().to_ascii_lowercase().as_str() {
            "asc" => Direction::Asc,
            "desc" => Direction::Desc,
            _ => {
                return Err(Error::InvalidFilter {
                    field: "sort",
                    value: s.to_string(),
                })
            }
        };
        Ok(Sort::By(SortColumn::parse(col, family)?, direction))
    }
}

/// A parameter value in positional order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Bind {
    Text(String),
    Int(i64),
}

/// One `AND`-ed condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    Regexp { column: &'static str, pattern: String },
    Equals { column: &'static str, value: String },
    InSet { column: &'static str, values: Vec<String>, negated: bool },
    AtLeast { column: &'static str, value: i64 },
    GreaterThan { column: &'static str, value: i64 },
}

impl Predicate {
    fn render(&self, binds: &mut Vec<Bind>) -> Option<String> {
        match self {
            Predicate::Regexp { column, pattern } => {
                binds.push(Bind::Text(pattern.clone()));
                Some(format!("{} REGEXP ?", column))
            }
            Predicate::Equals { column, value } => {
                binds.push(Bind::Text(value.clone()));
                Some(format!("{} = ?", column))
            }
            Predicate::InSet {
                column,
                values,
                negated,
            } => {
                if values.is_empty() {
                    // IN () matches nothing; NOT IN () matches everything.
                    return (!negated).then(|| "0 = 1".to_string());
                }
                binds.extend(values.iter().cloned().map(Bind::Text));
                let marks = vec!["?"; values.len()].join(", ");
                let op = if *negated { "NOT IN" } else { "IN" };
                Some(format!("{} {} ({})", column, op, marks))
            }
            Predicate::AtLeast { column, value } => {
                binds.push(Bind::Int(*value));
                Some(format!("{} >= ?", column))
            }
            Predicate::GreaterThan { column, value } => {
                binds.push(Bind::Int(*value));
                Some(format!("{} > ?", column))
            }
        }
    }
}

/// Translate a restricted glob into a case-insensitive regex.
///
/// Accepted characters: letters, digits, whitespace, `' . , - : &` and the
/// wildcard `*`. Literals are escaped, `*` becomes `.*`, and the pattern is
/// anchored on a word boundary at each edge that is a word character.
pub fn glob_to_regex(field: &'static str, glob: &str) -> Result<String> {
    let invalid = || Error::InvalidFilter {
        field,
        value: glob.to_string(),
    };
    let glob = glob.trim();
    if glob.is_empty() || glob.chars().all(|c| c == '*') {
        return Err(invalid());
    }
    if !glob
        .chars()
        .all(|c| c.is_alphanumeric() || c.is_whitespace() || "'.,-:&*".contains(c))
    {
        return Err(invalid());
    }

    let mut out = String::from("(?i)");
    let is_word = |c: Option<char>| c.is_some_and(char::is_alphanumeric);
    if is_word(glob.chars().next()) {
        out.push_str(r"\b");
    }
    for c in glob.chars() {
        if c == '*' {
            out.push_str(".*");
        } else {
            out.push_str(&regex::escape(c.encode_utf8(&mut [0; 4])));
        }
    }
    if is_word(glob.chars().last()) {
        out.push_str(r"\b");
    }
    Ok(out)
}

/// Every optional criterion of a ranked report request.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedQuerySpec {
    pub family: ReportFamily,
    /// Count column used for the default sort and the minimum-count filter.
    pub period: CountColumn,
    pub window: Option<PublicationWindow>,
    pub author: Option<String>,
    pub title: Option<String>,
    pub source_name: Option<String>,
    pub source_code: Option<String>,
    pub content_class: Option<ContentClass>,
    /// Keep rows whose period count is strictly greater than this.
    pub min_count: Option<i64>,
    pub sort: Sort,
    pub limit: Option<u32>,
    pub offset: u32,
}

/// Rendered queries plus their positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedQuery {
    pub sql: String,
    pub binds: Vec<Bind>,
    pub count_sql: String,
    pub count_binds: Vec<Bind>,
}

impl RankedQuerySpec {
    pub fn new(family: ReportFamily) -> Self {
        Self {
            family,
            period: family.default_period(),
            window: None,
            author: None,
            title: None,
            source_name: None,
            source_code: None,
            content_class: None,
            min_count: None,
            sort: Sort::Default,
            limit: None,
            offset: 0,
        }
    }

    /// Most-viewed defaults: last twelve months, journals, five years back.
    pub fn most_viewed() -> Self {
        Self {
            window: Some(PublicationWindow::Years(5)),
            content_class: Some(ContentClass::Journals),
            ..Self::new(ReportFamily::MostViewed)
        }
    }

    pub fn most_cited() -> Self {
        Self::new(ReportFamily::MostCited)
    }

    pub fn predicates(&self, sources: &SourcesConfig, current_year: i32) -> Result<Vec<Predicate>> {
        if self.period.family() != self.family {
            return Err(Error::InvalidFilter {
                field: "period",
                value: self.period.name().to_string(),
            });
        }

        let mut preds = Vec::new();
        if let Some(class) = self.content_class {
            let (values, negated) = match class {
                ContentClass::Journals => (
                    sources
                        .book_codes
                        .iter()
                        .chain(&sources.video_codes)
                        .cloned()
                        .collect(),
                    true,
                ),
                ContentClass::Books => (sources.book_codes.clone(), false),
                ContentClass::Videos => (sources.video_codes.clone(), false),
            };
            preds.push(Predicate::InSet {
                column: "source_code",
                values,
                negated,
            });
        }
        if let Some(author) = &self.author {
            preds.push(Predicate::Regexp {
                column: "hdgauthor",
                pattern: glob_to_regex("author", author)?,
            });
        }
        if let Some(min) = self.min_count {
            preds.push(Predicate::GreaterThan {
                column: self.period.name(),
                value: min,
            });
        }
        if let Some(title) = &self.title {
            preds.push(Predicate::Regexp {
                column: "hdgtitle",
                pattern: glob_to_regex("title", title)?,
            });
        }
        if let Some(code) = &self.source_code {
            preds.push(Predicate::Equals {
                column: "source_code",
                value: code.trim().to_uppercase(),
            });
        }
        if let Some(name) = &self.source_name {
            preds.push(Predicate::Regexp {
                column: "srctitleseries",
                pattern: glob_to_regex("source_name", name)?,
            });
        }
        if let Some(window) = self.window {
            preds.push(Predicate::AtLeast {
                column: self.family.year_column(),
                value: i64::from(current_year) - i64::from(window.years()),
            });
        }
        Ok(preds)
    }

    /// Compose against the current calendar year.
    pub fn build(&self, sources: &SourcesConfig) -> Result<RankedQuery> {
        self.build_for_year(sources, Utc::now().year())
    }

    pub fn build_for_year(&self, sources: &SourcesConfig, current_year: i32) -> Result<RankedQuery> {
        let mut binds = Vec::new();
        let mut clauses = vec!["1 = 1".to_string()];
        for pred in self.predicates(sources, current_year)? {
            if let Some(clause) = pred.render(&mut binds) {
                clauses.push(clause);
            }
        }

        let projection = self.family.columns().join(", ");
        let base = format!(
            "SELECT DISTINCT {} FROM {} WHERE {}",
            projection,
            self.family.view(),
            clauses.join(" AND ")
        );
        let count_sql = format!("SELECT COUNT(*) FROM ({})", base);
        let count_binds = binds.clone();

        let mut sql = base;
        match self.sort {
            Sort::Default => sql.push_str(&format!(" ORDER BY {} DESC", self.period.name())),
            Sort::None => {}
            Sort::By(col, dir) => {
                if let SortColumn::Count(c) = col {
                    if c.family() != self.family {
                        return Err(Error::InvalidFilter {
                            field: "sort",
                            value: c.name().to_string(),
                        });
                    }
                }
                sql.push_str(&format!(" ORDER BY {} {}", col.name(self.family), dir.sql()));
            }
        }
        match (self.limit, self.offset) {
            (Some(limit), offset) => {
                sql.push_str(" LIMIT ? OFFSET ?");
                binds.push(Bind::Int(i64::from(limit)));
                binds.push(Bind::Int(i64::from(offset)));
            }
            (None, 0) => {}
            (None, offset) => {
                sql.push_str(" LIMIT -1 OFFSET ?");
                binds.push(Bind::Int(i64::from(offset)));
            }
        }

        Ok(RankedQuery {
            sql,
            binds,
            count_sql,
            count_binds,
        })
    }
}
