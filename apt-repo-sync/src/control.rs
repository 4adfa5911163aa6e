// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Control file primitives.

Every piece of repository metadata handled by this crate (`Release`, `InRelease`,
`Packages`, `Sources`) is a *control file*: a series of *paragraphs* separated by
blank lines, each paragraph an ordered list of `Name: value` fields.

See <https://www.debian.org/doc/debian-policy/ch-controlfields.html>
for the canonical source of truth for how control files work.
*/

use {
    crate::error::{RepoSyncError, Result},
    chrono::{DateTime, TimeZone, Utc},
    serde::{Deserialize, Serialize},
    std::{
        borrow::Cow,
        io::{BufRead, Write},
    },
};

/// A field in a control file.
///
/// The value is stored as it appeared in the source, minus the whitespace
/// surrounding the first line. Continuation lines keep their leading whitespace
/// so a field is written back exactly as it was read.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct ControlField<'a> {
    name: Cow<'a, str>,
    value: Cow<'a, str>,
}

impl<'a> ControlField<'a> {
    /// Construct an instance from a field name and value.
    pub fn new(name: Cow<'a, str>, value: Cow<'a, str>) -> Self {
        Self { name, value }
    }

    /// Construct a multiline field from an iterable of lines.
    ///
    /// The first line of the value is left empty, which is how `Release` files
    /// express checksum lists. Each line should not have leading whitespace.
    pub fn from_lines(name: Cow<'a, str>, lines: impl Iterator<Item = String>) -> Self {
        let value = lines
            .map(|line| format!("\n {}", line))
            .collect::<String>()
            .into();

        Self { name, value }
    }

    /// The name of this field.
    pub fn name(&self) -> &str {
        self.name.as_ref()
    }

    /// Obtain the value as a [&str].
    ///
    /// The value's original file formatting (including newlines and leading whitespace)
    /// is included.
    pub fn value_str(&self) -> &str {
        self.value.as_ref()
    }

    /// Obtain an iterator of words in the value.
    pub fn iter_words(&self) -> Box<dyn Iterator<Item = &str> + '_> {
        Box::new(self.value.as_ref().split_ascii_whitespace())
    }

    /// Obtain an iterator of non-empty lines in the value.
    ///
    /// Leading whitespace from each line is stripped.
    pub fn iter_lines(&self) -> Box<dyn Iterator<Item = &str> + '_> {
        Box::new(
            self.value
                .lines()
                .map(|x| x.trim_start())
                .filter(|x| !x.is_empty()),
        )
    }

    /// Convert to an instance with a `'static` lifetime.
    pub fn into_owned(self) -> ControlField<'static> {
        ControlField {
            name: Cow::Owned(self.name.into_owned()),
            value: Cow::Owned(self.value.into_owned()),
        }
    }

    /// Write the contents of this field to a writer.
    pub fn write<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_all(self.name.as_bytes())?;
        if self.value.starts_with('\n') || self.value.is_empty() {
            writer.write_all(b":")?;
        } else {
            writer.write_all(b": ")?;
        }
        writer.write_all(self.value.as_ref().as_bytes())?;
        writer.write_all(b"\n")
    }
}

/// A paragraph in a control file.
///
/// A paragraph is an ordered series of control fields.
///
/// Field names are case insensitive on read and case preserving on set.
///
/// Paragraphs can only contain a single occurrence of a field and this is enforced through
/// the mutation APIs.
#[derive(Clone, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct ControlParagraph<'a> {
    fields: Vec<ControlField<'a>>,
}

impl<'a> ControlParagraph<'a> {
    /// Whether the paragraph is empty.
    ///
    /// Empty is defined by the lack of any fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Set the value of a field via a [ControlField].
    ///
    /// If a field with the same name (case insensitive compare) already exists, its
    /// value is replaced in place, retaining the field's position. Otherwise the field is
    /// appended.
    pub fn set_field(&mut self, field: ControlField<'a>) {
        if let Some(existing) = self
            .fields
            .iter_mut()
            .find(|cf| cf.name.eq_ignore_ascii_case(&field.name))
        {
            *existing = field;
        } else {
            self.fields.push(field);
        }
    }

    /// Set the value of a field defined via strings.
    ///
    /// If a field with the same name (case insensitive compare) already exists, the old value
    /// will be replaced by the incoming value.
    pub fn set_field_from_string(&mut self, name: Cow<'a, str>, value: Cow<'a, str>) {
        self.set_field(ControlField::new(name, value));
    }

    /// Remove a field, returning it if it was present.
    pub fn remove_field(&mut self, name: &str) -> Option<ControlField<'a>> {
        let index = self
            .fields
            .iter()
            .position(|cf| cf.name.eq_ignore_ascii_case(name))?;

        Some(self.fields.remove(index))
    }

    /// Whether a named field is present in this paragraph.
    pub fn has_field(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    /// Iterate over fields in this paragraph.
    ///
    /// Iteration order is insertion order.
    pub fn iter_fields(&self) -> impl Iterator<Item = &ControlField<'a>> {
        self.fields.iter()
    }

    /// Obtain the field with a given name in this paragraph.
    pub fn field(&self, name: &str) -> Option<&'_ ControlField<'a>> {
        self.fields
            .iter()
            .find(|f| f.name.as_ref().eq_ignore_ascii_case(name))
    }

    /// Obtain the raw string value of the named field.
    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.field(name).map(|f| f.value_str())
    }

    /// Obtain the raw string value of a field that must be present.
    ///
    /// `kind` names the flavor of paragraph being read and is used in the error.
    pub fn required_field_str(&self, kind: &'static str, name: &'static str) -> Result<&str> {
        self.field_str(name)
            .ok_or(RepoSyncError::MissingField(kind, name))
    }

    /// Obtain the value of a field, evaluated as a boolean.
    ///
    /// The field is [true] iff its string value is `yes`.
    pub fn field_bool(&self, name: &str) -> Option<bool> {
        self.field_str(name).map(|v| matches!(v, "yes"))
    }

    /// Obtain the value of a field parsed as an unsigned integer.
    pub fn field_u64(&self, name: &str) -> Option<Result<u64>> {
        self.field_str(name).map(|v| Ok(v.trim().parse::<u64>()?))
    }

    /// Obtain the value of a field parsed as an RFC 5322 date.
    ///
    /// The time zone is normalized to UTC.
    pub fn field_datetime_rfc5322(&self, name: &str) -> Option<Result<DateTime<Utc>>> {
        self.field_str(name).map(|v| {
            let timestamp = mailparse::dateparse(v)?;

            Utc.timestamp_opt(timestamp, 0)
                .single()
                .ok_or_else(|| RepoSyncError::MalformedField("Date", v.to_string()))
        })
    }

    /// Obtain an iterator of words in the named field.
    pub fn iter_field_words(&self, name: &str) -> Option<Box<dyn Iterator<Item = &str> + '_>> {
        self.field(name).map(|f| f.iter_words())
    }

    /// Obtain an iterator of lines in the named field.
    pub fn iter_field_lines(&self, name: &str) -> Option<Box<dyn Iterator<Item = &str> + '_>> {
        self.field(name).map(|f| f.iter_lines())
    }

    /// Convert to an instance with a `'static` lifetime.
    pub fn into_owned(self) -> ControlParagraph<'static> {
        ControlParagraph {
            fields: self.fields.into_iter().map(|f| f.into_owned()).collect(),
        }
    }

    /// Serialize the paragraph to a writer.
    ///
    /// A trailing newline is written as part of the final field. However, an
    /// extra newline is not present. So if serializing multiple paragraphs, an
    /// additional line break must be written to effectively terminate this paragraph
    /// if the writer is not at EOF.
    pub fn write<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        for field in &self.fields {
            field.write(writer)?;
        }

        Ok(())
    }
}

impl<'a> ToString for ControlParagraph<'a> {
    fn to_string(&self) -> String {
        let mut buffer = vec![];
        // Writing to a Vec cannot fail.
        let _ = self.write(&mut buffer);

        String::from_utf8_lossy(&buffer).into_owned()
    }
}

/// Holds parsing state for Debian control files.
///
/// Instances of this type are essentially fed lines of text and periodically emit
/// [ControlParagraph] instances as they are completed.
#[derive(Clone, Debug, Default)]
pub struct ControlFileParser {
    paragraph: ControlParagraph<'static>,
    field: Option<String>,
}

impl ControlFileParser {
    /// Write a line to the parser.
    ///
    /// If the line terminates an in-progress paragraph, that paragraph will be returned.
    /// Otherwise `Ok(None)` is returned.
    ///
    /// `Err` is returned if the control file in invalid.
    pub fn write_line(&mut self, line: &str) -> Result<Option<ControlParagraph<'static>>> {
        let is_empty_line = line.trim().is_empty();
        let is_indented = (line.starts_with(' ') || line.starts_with('\t')) && !is_empty_line;

        let current_field = self.field.take();

        // Empty lines signify the end of a paragraph. Flush any state.
        if is_empty_line {
            if let Some(field) = current_field {
                self.flush_field(field)?;
            }

            return Ok(if self.paragraph.is_empty() {
                None
            } else {
                Some(std::mem::take(&mut self.paragraph))
            });
        }

        match (current_field, is_indented) {
            // An unindented line while a field is pending starts a new field.
            (Some(v), false) => {
                self.flush_field(v)?;
                self.field = Some(line.to_string());

                Ok(None)
            }
            (None, true) => Err(RepoSyncError::ControlParseError(format!(
                "continuation line without a field: {}",
                line.trim_end()
            ))),
            (None, false) => {
                self.field = Some(line.to_string());

                Ok(None)
            }
            // Value continuation.
            (Some(v), true) => {
                self.field = Some(v + line);

                Ok(None)
            }
        }
    }

    /// Finish parsing, consuming self.
    ///
    /// If a non-empty paragraph is present in the instance, it will be returned. Else if there
    /// is no unflushed state, None is returned.
    pub fn finish(mut self) -> Result<Option<ControlParagraph<'static>>> {
        if let Some(field) = self.field.take() {
            self.flush_field(field)?;
        }

        Ok(if self.paragraph.is_empty() {
            None
        } else {
            Some(self.paragraph)
        })
    }

    fn flush_field(&mut self, v: String) -> Result<()> {
        let (name, value) = v.split_once(':').ok_or_else(|| {
            RepoSyncError::ControlParseError(format!(
                "error parsing line '{}'; missing colon",
                v.trim_end()
            ))
        })?;

        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(RepoSyncError::ControlParseError(format!(
                "invalid field name '{}'",
                name
            )));
        }

        let value = value.trim_end().trim_start_matches(|c| c == ' ' || c == '\t');
        let value = value.replace("\r\n", "\n");

        self.paragraph
            .set_field_from_string(Cow::Owned(name.to_string()), Cow::Owned(value));

        Ok(())
    }
}

/// A reader for [ControlParagraph].
///
/// Instances are bound to a reader, which is capable of feeding lines into a parser.
///
/// Instances can be consumed as an iterator. Each call into the iterator will attempt to
/// read a full paragraph from the underlying reader.
pub struct ControlParagraphReader<R: BufRead> {
    reader: R,
    parser: Option<ControlFileParser>,
}

impl<R: BufRead> ControlParagraphReader<R> {
    /// Create a new instance bound to a reader.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            parser: Some(ControlFileParser::default()),
        }
    }

    fn get_next(&mut self) -> Result<Option<ControlParagraph<'static>>> {
        let mut parser = if let Some(parser) = self.parser.take() {
            parser
        } else {
            return Ok(None);
        };

        loop {
            let mut line = String::new();

            let bytes_read = self.reader.read_line(&mut line).map_err(|e| {
                if e.kind() == std::io::ErrorKind::InvalidData {
                    RepoSyncError::ControlNotUtf8
                } else {
                    RepoSyncError::Io(e)
                }
            })?;

            if bytes_read != 0 {
                if let Some(paragraph) = parser.write_line(&line)? {
                    self.parser.replace(parser);
                    return Ok(Some(paragraph));
                }
            } else {
                return parser.finish();
            }
        }
    }
}

impl<R: BufRead> Iterator for ControlParagraphReader<R> {
    type Item = Result<ControlParagraph<'static>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.get_next() {
            Ok(Some(para)) => Some(Ok(para)),
            Ok(None) => None,
            Err(e) => {
                self.parser = None;
                Some(Err(e))
            }
        }
    }
}

/// A debian control file.
///
/// A control file is an ordered series of paragraphs.
#[derive(Clone, Debug, Default)]
pub struct ControlFile<'a> {
    paragraphs: Vec<ControlParagraph<'a>>,
}

impl<'a> ControlFile<'a> {
    /// Construct a new instance by parsing data from a reader.
    pub fn parse_reader<R: BufRead>(reader: R) -> Result<Self> {
        let paragraphs = ControlParagraphReader::new(reader).collect::<Result<Vec<_>>>()?;

        Ok(Self { paragraphs })
    }

    /// Parse a control file from raw bytes.
    pub fn parse_bytes(data: &[u8]) -> Result<Self> {
        Self::parse_reader(std::io::Cursor::new(data))
    }

    /// Parse a control file from a string.
    pub fn parse_str(s: &str) -> Result<Self> {
        Self::parse_bytes(s.as_bytes())
    }

    /// Add a paragraph to this control file.
    pub fn add_paragraph(&mut self, p: ControlParagraph<'a>) {
        self.paragraphs.push(p);
    }

    /// Obtain paragraphs in this control file.
    pub fn paragraphs(&self) -> impl Iterator<Item = &ControlParagraph<'a>> {
        self.paragraphs.iter()
    }

    /// Obtain paragraphs in this control file, consuming self.
    pub fn into_paragraphs(self) -> impl Iterator<Item = ControlParagraph<'a>> {
        self.paragraphs.into_iter()
    }

    /// Serialize the control file to a writer.
    ///
    /// Paragraphs are separated by a single empty line.
    pub fn write<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        for (i, p) in self.paragraphs.iter().enumerate() {
            if i > 0 {
                writer.write_all(b"\n")?;
            }
            p.write(writer)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use {super::*, indoc::indoc};

    #[test]
    fn control_paragraph_field_semantics() {
        let mut p = ControlParagraph::default();

        // Same cased field name results in overwrite.
        p.set_field_from_string("foo".into(), "bar".into());
        p.set_field_from_string("foo".into(), "baz".into());
        assert_eq!(p.field("foo").unwrap().value, "baz");

        // Different case results in overwrite.
        p.set_field_from_string("FOO".into(), "bar".into());
        assert_eq!(p.field("foo").unwrap().value, "bar");
        assert_eq!(p.field("FOO").unwrap().value, "bar");
        assert_eq!(p.iter_fields().count(), 1);

        p.set_field_from_string("other".into(), "value".into());
        p.set_field_from_string("Foo".into(), "again".into());
        assert_eq!(
            p.iter_fields().map(|f| f.name()).collect::<Vec<_>>(),
            vec!["Foo", "other"]
        );

        assert!(p.remove_field("FOO").is_some());
        assert!(!p.has_field("foo"));
    }

    #[test]
    fn parse_multiple_paragraphs() -> Result<()> {
        let data = indoc! {"
            Package: foo
            Version: 1.0
            Description: short
             long line one
             .
             long line two

            Package: bar
            Version: 2.0
        "};

        let cf = ControlFile::parse_str(data)?;
        let paragraphs = cf.paragraphs().collect::<Vec<_>>();
        assert_eq!(paragraphs.len(), 2);
        assert_eq!(paragraphs[0].field_str("package"), Some("foo"));
        assert_eq!(
            paragraphs[0].field_str("Description"),
            Some("short\n long line one\n .\n long line two")
        );
        assert_eq!(
            paragraphs[0]
                .iter_field_lines("Description")
                .unwrap()
                .collect::<Vec<_>>(),
            vec!["short", "long line one", ".", "long line two"]
        );
        assert_eq!(paragraphs[1].field_str("Version"), Some("2.0"));

        Ok(())
    }

    #[test]
    fn round_trip_preserves_formatting() -> Result<()> {
        let data = indoc! {"
            Origin: Debian
            X-Custom-Field: keep me
            MD5Sum:
             0123 10 main/binary-amd64/Packages
             4567 20 main/binary-amd64/Packages.gz

            Package: foo
            Description: short
             continued
        "};

        let cf = ControlFile::parse_str(data)?;
        let mut out = vec![];
        cf.write(&mut out)?;
        assert_eq!(String::from_utf8(out).unwrap(), data);

        Ok(())
    }

    #[test]
    fn parse_errors() {
        assert!(matches!(
            ControlFile::parse_str("no colon here\n"),
            Err(RepoSyncError::ControlParseError(_))
        ));
        assert!(matches!(
            ControlFile::parse_str(" leading continuation\n"),
            Err(RepoSyncError::ControlParseError(_))
        ));
        assert!(matches!(
            ControlFile::parse_bytes(b"Package: \xff\xfe\n"),
            Err(RepoSyncError::ControlNotUtf8)
        ));
    }

    #[test]
    fn required_and_typed_fields() -> Result<()> {
        let cf = ControlFile::parse_str(indoc! {"
            Size: 1234
            Acquire-By-Hash: yes
            Date: Sat, 09 Oct 2021 09:34:56 UTC
        "})?;
        let p = cf.paragraphs().next().unwrap();

        assert_eq!(p.field_u64("size").unwrap()?, 1234);
        assert_eq!(p.field_bool("Acquire-By-Hash"), Some(true));
        assert_eq!(
            p.field_datetime_rfc5322("Date").unwrap()?,
            Utc.with_ymd_and_hms(2021, 10, 9, 9, 34, 56).unwrap()
        );
        assert!(matches!(
            p.required_field_str("Packages", "Version"),
            Err(RepoSyncError::MissingField("Packages", "Version"))
        ));

        Ok(())
    }

    #[test]
    fn field_words_and_lines() -> Result<()> {
        let cf = ControlFile::parse_str(indoc! {"
            Architectures: amd64  arm64 all
            SHA256:
             00 1 main/binary-amd64/Packages
             01 2 main/binary-arm64/Packages
        "})?;
        let p = cf.paragraphs().next().unwrap();

        assert_eq!(
            p.iter_field_words("Architectures").unwrap().collect::<Vec<_>>(),
            vec!["amd64", "arm64", "all"]
        );
        assert_eq!(
            p.iter_field_lines("SHA256").unwrap().collect::<Vec<_>>(),
            vec!["00 1 main/binary-amd64/Packages", "01 2 main/binary-arm64/Packages"]
        );
        assert!(p.iter_field_words("Components").is_none());

        Ok(())
    }
}
