// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Control file paragraphs.

Archive metadata (`Release`, `Packages`, `Sources`, `.dsc` and `.deb` control
files) is a sequence of *paragraphs* of `Name: value` fields separated by blank
lines. Continuation lines begin with whitespace.

See <https://www.debian.org/doc/debian-policy/ch-controlfields.html>.
*/

use {
    crate::error::{ArchiveError, Result},
    chrono::{DateTime, TimeZone, Utc},
    futures::{AsyncBufRead, AsyncBufReadExt},
    std::{
        fmt::{Display, Formatter},
        io::{BufRead, Write},
        str::FromStr,
    },
};

/// A field in a control paragraph.
///
/// The value retains the interior line structure of folded and multiline fields:
/// continuation lines keep their leading space.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ControlField {
    name: String,
    value: String,
}

impl ControlField {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Construct a multiline field from its lines.
    ///
    /// Lines should not have leading whitespace. An empty first line produces the
    /// `Name:` followed by newline form used by `Release` checksum fields.
    pub fn from_lines(name: impl Into<String>, lines: impl IntoIterator<Item = String>) -> Self {
        let value = lines
            .into_iter()
            .enumerate()
            .map(|(i, line)| if i == 0 { line } else { format!(" {}", line) })
            .collect::<Vec<_>>()
            .join("\n");

        Self {
            name: name.into(),
            value,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The raw value, including interior newlines.
    pub fn value_str(&self) -> &str {
        &self.value
    }

    /// Iterate over whitespace delimited words in the value.
    pub fn iter_words(&self) -> impl Iterator<Item = &str> {
        self.value.split_ascii_whitespace()
    }

    /// Iterate over non-empty lines in the value with leading whitespace stripped.
    pub fn iter_lines(&self) -> impl Iterator<Item = &str> {
        self.value
            .lines()
            .map(|l| l.trim_start())
            .filter(|l| !l.is_empty())
    }

    /// Write the field, including its trailing newline.
    pub fn write<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_all(self.name.as_bytes())?;

        if self.value.starts_with('\n') {
            writer.write_all(b":")?;
        } else {
            writer.write_all(b": ")?;
        }

        writer.write_all(self.value.as_bytes())?;
        writer.write_all(b"\n")
    }
}

impl Display for ControlField {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut buf = vec![];
        self.write(&mut buf).map_err(|_| std::fmt::Error)?;
        f.write_str(&String::from_utf8_lossy(&buf))
    }
}

/// An ordered series of control fields.
///
/// Field names are case insensitive on read and case preserving on set. A name
/// occurs at most once.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ControlParagraph {
    fields: Vec<ControlField>,
}

impl ControlParagraph {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Set a field, replacing any existing field of the same name in place.
    pub fn set_field(&mut self, field: ControlField) {
        if let Some(existing) = self
            .fields
            .iter_mut()
            .find(|f| f.name.eq_ignore_ascii_case(&field.name))
        {
            *existing = field;
        } else {
            self.fields.push(field);
        }
    }

    /// Set a field from a name and value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.set_field(ControlField::new(name, value));
    }

    /// Remove a field, returning it if present.
    pub fn remove_field(&mut self, name: &str) -> Option<ControlField> {
        let pos = self
            .fields
            .iter()
            .position(|f| f.name.eq_ignore_ascii_case(name))?;

        Some(self.fields.remove(pos))
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    /// Iterate over fields in insertion order.
    pub fn iter_fields(&self) -> impl Iterator<Item = &ControlField> {
        self.fields.iter()
    }

    pub fn field(&self, name: &str) -> Option<&ControlField> {
        self.fields
            .iter()
            .find(|f| f.name.eq_ignore_ascii_case(name))
    }

    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.field(name).map(|f| f.value_str())
    }

    /// The value of a field that must be present.
    ///
    /// `kind` names the paragraph flavor for error reporting.
    pub fn required_field_str(&self, kind: &'static str, name: &'static str) -> Result<&str> {
        self.field_str(name)
            .ok_or(ArchiveError::ControlRequiredFieldMissing(kind, name))
    }

    /// The value of a field evaluated as a boolean.
    ///
    /// The field is [true] iff its value is `yes`.
    pub fn field_bool(&self, name: &str) -> Option<bool> {
        self.field_str(name).map(|v| v.trim() == "yes")
    }

    pub fn field_u64(&self, name: &str) -> Option<Result<u64>> {
        self.field_str(name)
            .map(|v| u64::from_str(v.trim()).map_err(ArchiveError::from))
    }

    /// The value of a field parsed as an RFC 5322 date, normalized to UTC.
    pub fn field_datetime_rfc5322(&self, name: &str) -> Option<Result<DateTime<Utc>>> {
        self.field_str(name).map(|v| {
            let timestamp = mailparse::dateparse(v)?;

            Utc.timestamp_opt(timestamp, 0)
                .single()
                .ok_or_else(|| ArchiveError::ControlParseError(format!("invalid date: {}", v)))
        })
    }

    pub fn iter_field_words(&self, name: &str) -> Option<impl Iterator<Item = &str>> {
        self.field(name).map(|f| f.iter_words())
    }

    pub fn iter_field_lines(&self, name: &str) -> Option<impl Iterator<Item = &str>> {
        self.field(name).map(|f| f.iter_lines())
    }

    /// Write the paragraph.
    ///
    /// No blank line is emitted after the final field.
    pub fn write<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        for field in &self.fields {
            field.write(writer)?;
        }

        Ok(())
    }
}

impl Display for ControlParagraph {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for field in &self.fields {
            write!(f, "{}", field)?;
        }

        Ok(())
    }
}

/// Incremental control file parser.
///
/// Lines are fed in and completed paragraphs come out.
#[derive(Clone, Debug, Default)]
pub struct ControlFileParser {
    paragraph: ControlParagraph,
    field: Option<String>,
}

impl ControlFileParser {
    /// Feed a line, with or without its line terminator.
    ///
    /// Returns a paragraph if this line terminated one.
    pub fn write_line(&mut self, line: &str) -> Result<Option<ControlParagraph>> {
        let line = line.trim_end_matches(|c| c == '\n' || c == '\r');

        if line.trim().is_empty() {
            if let Some(field) = self.field.take() {
                self.flush_field(field)?;
            }

            return Ok(if self.paragraph.is_empty() {
                None
            } else {
                Some(std::mem::take(&mut self.paragraph))
            });
        }

        // `#` comments are only permitted in some control files but never appear as
        // meaningful content in archive indices.
        if line.starts_with('#') {
            return Ok(None);
        }

        let continuation = line.starts_with(' ') || line.starts_with('\t');

        match (self.field.take(), continuation) {
            (Some(mut current), true) => {
                current.push('\n');
                current.push_str(line);
                self.field = Some(current);
            }
            (None, true) => {
                return Err(ArchiveError::ControlParseError(format!(
                    "continuation line without a field: {}",
                    line
                )));
            }
            (Some(current), false) => {
                self.flush_field(current)?;
                self.field = Some(line.to_string());
            }
            (None, false) => {
                self.field = Some(line.to_string());
            }
        }

        Ok(None)
    }

    /// Finish parsing, returning any paragraph still in progress.
    pub fn finish(mut self) -> Result<Option<ControlParagraph>> {
        if let Some(field) = self.field.take() {
            self.flush_field(field)?;
        }

        Ok(if self.paragraph.is_empty() {
            None
        } else {
            Some(self.paragraph)
        })
    }

    fn flush_field(&mut self, raw: String) -> Result<()> {
        let (name, value) = raw.split_once(':').ok_or_else(|| {
            ArchiveError::ControlParseError(format!("error parsing line '{}'; missing colon", raw))
        })?;

        let name = name.trim();
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(ArchiveError::ControlParseError(format!(
                "invalid field name in '{}'",
                raw
            )));
        }

        // A value starting on the line after the name keeps its leading newline.
        let value = value
            .trim_start_matches(|c| c == ' ' || c == '\t')
            .trim_end();

        self.paragraph.set(name, value);

        Ok(())
    }
}

/// A streaming reader of [ControlParagraph] over a [BufRead].
///
/// Instances are iterators; each step reads one full paragraph.
pub struct ControlParagraphReader<R: BufRead> {
    reader: R,
    parser: Option<ControlFileParser>,
}

impl<R: BufRead> ControlParagraphReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            parser: Some(ControlFileParser::default()),
        }
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    fn get_next(&mut self) -> Result<Option<ControlParagraph>> {
        let mut parser = match self.parser.take() {
            Some(parser) => parser,
            None => return Ok(None),
        };

        let mut line = String::new();

        loop {
            line.clear();

            if self.reader.read_line(&mut line)? == 0 {
                return parser.finish();
            }

            if let Some(paragraph) = parser.write_line(&line)? {
                self.parser = Some(parser);
                return Ok(Some(paragraph));
            }
        }
    }
}

impl<R: BufRead> Iterator for ControlParagraphReader<R> {
    type Item = Result<ControlParagraph>;

    fn next(&mut self) -> Option<Self::Item> {
        self.get_next().transpose()
    }
}

/// An asynchronous reader of [ControlParagraph].
pub struct ControlParagraphAsyncReader<R> {
    reader: R,
    parser: Option<ControlFileParser>,
}

impl<R> ControlParagraphAsyncReader<R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            parser: Some(ControlFileParser::default()),
        }
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    /// Read the next paragraph.
    ///
    /// Resolves to [None] at end of input.
    pub async fn read_paragraph(&mut self) -> Result<Option<ControlParagraph>> {
        let mut parser = match self.parser.take() {
            Some(parser) => parser,
            None => return Ok(None),
        };

        let mut line = String::new();

        loop {
            line.clear();

            if self.reader.read_line(&mut line).await? == 0 {
                return parser.finish();
            }

            if let Some(paragraph) = parser.write_line(&line)? {
                self.parser = Some(parser);
                return Ok(Some(paragraph));
            }
        }
    }
}

/// Parse every paragraph in a string.
pub fn parse_paragraphs(s: &str) -> Result<Vec<ControlParagraph>> {
    ControlParagraphReader::new(s.as_bytes()).collect()
}

/// Writes a sequence of paragraphs separated by blank lines.
pub struct ControlParagraphWriter<W> {
    writer: W,
    count: usize,
}

impl<W: Write> ControlParagraphWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, count: 0 }
    }

    /// Encode one paragraph.
    pub fn write_paragraph(&mut self, paragraph: &ControlParagraph) -> std::io::Result<()> {
        if self.count > 0 {
            self.writer.write_all(b"\n")?;
        }

        paragraph.write(&mut self.writer)?;
        self.count += 1;

        Ok(())
    }

    /// Number of paragraphs written.
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.writer
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[cfg(test)]
mod tests {
    use {super::*, indoc::indoc};

    const RELEASE: &str = indoc! {"
        Origin: Debian
        Label: Debian
        Suite: stable
        Version: 11.1
        Codename: bullseye
        Date: Sat, 09 Oct 2021 09:34:56 +0000
        Acquire-By-Hash: yes
        Architectures: all amd64 arm64
        Components: main contrib non-free
        Description: Debian 11.1 Released 09 October 2021
        MD5Sum:
         7fdf4db15250af5368cc52a91e8edbce   738242 contrib/Contents-all
         cbd7bc4d3eb517ac2b22f929dfc07b47    57319 contrib/Contents-all.gz
    "};

    #[test]
    fn field_semantics() {
        let mut p = ControlParagraph::default();

        p.set("foo", "bar");
        p.set("foo", "baz");
        assert_eq!(p.field_str("foo"), Some("baz"));

        p.set("FOO", "bar");
        assert_eq!(p.field_str("foo"), Some("bar"));
        assert_eq!(p.iter_fields().count(), 1);

        p.set("other", "value");
        assert!(p.remove_field("FOO").is_some());
        assert!(!p.has_field("foo"));
        assert!(matches!(
            p.required_field_str("Test", "Missing"),
            Err(ArchiveError::ControlRequiredFieldMissing("Test", "Missing"))
        ));
    }

    #[test]
    fn parse_release_paragraph() -> Result<()> {
        let paragraphs = parse_paragraphs(RELEASE)?;
        assert_eq!(paragraphs.len(), 1);
        let p = &paragraphs[0];

        assert_eq!(p.iter_fields().count(), 11);
        assert_eq!(p.field_str("Origin"), Some("Debian"));
        assert_eq!(p.field_str("Version"), Some("11.1"));
        assert_eq!(p.field_bool("Acquire-By-Hash"), Some(true));
        assert_eq!(
            p.iter_field_words("Components").unwrap().collect::<Vec<_>>(),
            vec!["main", "contrib", "non-free"]
        );

        let lines = p.iter_field_lines("MD5Sum").unwrap().collect::<Vec<_>>();
        assert_eq!(
            lines,
            vec![
                "7fdf4db15250af5368cc52a91e8edbce   738242 contrib/Contents-all",
                "cbd7bc4d3eb517ac2b22f929dfc07b47    57319 contrib/Contents-all.gz",
            ]
        );

        let date = p.field_datetime_rfc5322("Date").unwrap()?;
        assert_eq!(date.timestamp(), 1633772096);

        Ok(())
    }

    #[test]
    fn multiple_paragraphs_and_continuations() -> Result<()> {
        let data = indoc! {"
            Package: a
            Description: short
             long line
             .
             more

            Package: b


            Package: c
        "};

        let paragraphs = parse_paragraphs(data)?;
        assert_eq!(paragraphs.len(), 3);
        assert_eq!(
            paragraphs[0].field_str("Description"),
            Some("short\n long line\n .\n more")
        );
        assert_eq!(paragraphs[2].field_str("Package"), Some("c"));

        Ok(())
    }

    #[test]
    fn parse_errors() {
        assert!(parse_paragraphs(" leading continuation\n").is_err());
        assert!(parse_paragraphs("no colon here\n").is_err());
    }

    #[test]
    fn write_round_trip() -> Result<()> {
        let paragraphs = parse_paragraphs(RELEASE)?;

        let mut writer = ControlParagraphWriter::new(vec![]);
        writer.write_paragraph(&paragraphs[0])?;
        writer.write_paragraph(&paragraphs[0])?;
        assert_eq!(writer.count(), 2);

        let data = String::from_utf8(writer.into_inner()).unwrap();
        let reparsed = parse_paragraphs(&data)?;
        assert_eq!(reparsed.len(), 2);
        assert_eq!(reparsed[0], paragraphs[0]);
        assert_eq!(reparsed[1], paragraphs[0]);

        let field = ControlField::from_lines(
            "SHA256",
            vec!["".to_string(), "aa 1 x".to_string(), "bb 2 y".to_string()],
        );
        assert_eq!(field.to_string(), "SHA256:\n aa 1 x\n bb 2 y\n");
        assert_eq!(field.iter_lines().collect::<Vec<_>>(), vec!["aa 1 x", "bb 2 y"]);

        Ok(())
    }

    #[tokio::test]
    async fn async_reader() -> Result<()> {
        let mut reader = ControlParagraphAsyncReader::new(futures::io::Cursor::new(
            b"Package: a\n\nPackage: b\n".to_vec(),
        ));

        let mut names = vec![];
        while let Some(p) = reader.read_paragraph().await? {
            names.push(p.field_str("Package").unwrap_or_default().to_string());
        }
        assert_eq!(names, vec!["a", "b"]);
        assert!(reader.read_paragraph().await?.is_none());

        Ok(())
    }
}
