use csv::Writer;
use log::{info, warn};
use once_cell::sync::Lazy;
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::env;
use std::error::Error;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write as IoWrite};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use unicode_normalization::UnicodeNormalization;

type Result<T> = std::result::Result<T, Box<dyn Error>>;

const ELEMENT_KINDS: [&str; 6] = ["node", "way", "relation", "meta", "bounds", "note"];

const ADDRESS_KEYS: [&str; 2] = ["addr:street", "addr:city"];

const LANGUAGE_KEYS: [&str; 4] = [
    "addr:street:fr",
    "addr:street:nl",
    "addr:city:fr",
    "addr:city:nl",
];

// A dash with whitespace or hyphen runs on both sides signals bilingual
// naming, e.g. "Rue de la Comtesse de Flandre - Gravin Van Vlaanderenstraat".
static BILINGUAL_DASH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\s-]+-[\s-]").expect("valid bilingual dash regex"));

// Characters that break downstream CSV or database ingestion of tag values.
static PROBLEM_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new("[=+&<>;\"?%#$@,\t\r\n]").expect("valid problem char regex"));

#[derive(Debug, Clone, PartialEq)]
struct Tag {
    k: String,
    v: String,
}

#[derive(Debug, Clone, PartialEq)]
enum Child {
    Tag(Tag),
    Other {
        name: String,
        attrs: Vec<(String, String)>,
    },
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
struct Element {
    kind: String,
    attrs: Vec<(String, String)>,
    children: Vec<Child>,
}

impl Element {
    fn tags(&self) -> impl Iterator<Item = &Tag> {
        self.children.iter().filter_map(|child| match child {
            Child::Tag(tag) => Some(tag),
            _ => None,
        })
    }

    fn tags_mut(&mut self) -> impl Iterator<Item = &mut Tag> {
        self.children.iter_mut().filter_map(|child| match child {
            Child::Tag(tag) => Some(tag),
            _ => None,
        })
    }
}

fn get_attr_value(event: &BytesStart<'_>, key: &[u8]) -> Result<Option<String>> {
    for attr in event.attributes().with_checks(false) {
        let attr = attr?;
        if attr.key.as_ref() == key {
            return Ok(Some(attr.unescape_value()?.to_string()));
        }
    }
    Ok(None)
}

fn collect_attrs(event: &BytesStart<'_>) -> Result<Vec<(String, String)>> {
    let mut attrs = Vec::new();
    for attr in event.attributes().with_checks(false) {
        let attr = attr?;
        attrs.push((
            String::from_utf8_lossy(attr.key.as_ref()).into_owned(),
            attr.unescape_value()?.into_owned(),
        ));
    }
    Ok(attrs)
}

/// Pull parser over an OSM XML extract. Yields the recognized top-level
/// elements one at a time in document order; peak memory stays proportional
/// to a single element's subtree regardless of file size.
struct ElementReader {
    reader: Reader<BufReader<File>>,
    buf: Vec<u8>,
    done: bool,
}

impl ElementReader {
    fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mut reader = Reader::from_reader(BufReader::new(file));
        reader.trim_text(true);
        Ok(Self {
            reader,
            buf: Vec::new(),
            done: false,
        })
    }

    fn next_element(&mut self) -> Result<Option<Element>> {
        loop {
            self.buf.clear();
            let opened = match self.reader.read_event_into(&mut self.buf)? {
                Event::Eof => return Ok(None),
                Event::Start(e) => {
                    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                    if ELEMENT_KINDS.contains(&name.as_str()) {
                        Some((name, collect_attrs(&e)?, true))
                    } else {
                        None
                    }
                }
                Event::Empty(e) => {
                    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                    if ELEMENT_KINDS.contains(&name.as_str()) {
                        Some((name, collect_attrs(&e)?, false))
                    } else {
                        None
                    }
                }
                _ => None,
            };
            match opened {
                Some((kind, attrs, true)) => return self.read_children(kind, attrs).map(Some),
                Some((kind, attrs, false)) => {
                    return Ok(Some(Element {
                        kind,
                        attrs,
                        children: Vec::new(),
                    }))
                }
                None => {}
            }
        }
    }

    fn read_children(&mut self, kind: String, attrs: Vec<(String, String)>) -> Result<Element> {
        let mut children = Vec::new();
        loop {
            self.buf.clear();
            match self.reader.read_event_into(&mut self.buf)? {
                Event::Start(e) | Event::Empty(e) => {
                    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                    if name == "tag" {
                        let k = get_attr_value(&e, b"k")?;
                        let v = get_attr_value(&e, b"v")?;
                        if let (Some(k), Some(v)) = (k, v) {
                            children.push(Child::Tag(Tag { k, v }));
                        }
                    } else {
                        children.push(Child::Other {
                            name,
                            attrs: collect_attrs(&e)?,
                        });
                    }
                }
                Event::Text(e) => {
                    let text = e.unescape()?.into_owned();
                    if !text.is_empty() {
                        children.push(Child::Text(text));
                    }
                }
                Event::End(e) => {
                    if e.name().as_ref() == kind.as_bytes() {
                        break;
                    }
                }
                Event::Eof => {
                    return Err(format!("unexpected end of document inside <{kind}>").into())
                }
                _ => {}
            }
        }
        Ok(Element {
            kind,
            attrs,
            children,
        })
    }
}

impl Iterator for ElementReader {
    type Item = Result<Element>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_element() {
            Ok(Some(element)) => Some(Ok(element)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

fn is_address(tag: &Tag, key: &str) -> bool {
    tag.k == key
}

/// Canonical decomposition, then drop everything outside 7-bit ASCII.
/// Lossy by contract: "Forêt" becomes "Foret".
fn normalize_encoding(value: &str) -> String {
    value.nfd().filter(char::is_ascii).collect()
}

type VariantDict = HashMap<String, String>;

/// Streams the file once and maps every recognized variant of a bilingual
/// name under `key` to its canonical bilingual form. A value "A - B" yields
/// four entries: "A - B", "A", "B" and "B - A". Monolingual values are never
/// inserted, so they are never rewritten.
fn build_dict(path: &Path, key: &str) -> Result<VariantDict> {
    let mut names = VariantDict::new();
    for element in ElementReader::open(path)? {
        let element = element?;
        for tag in element.tags() {
            if !is_address(tag, key) || !BILINGUAL_DASH.is_match(&tag.v) {
                continue;
            }
            let Some((left, right)) = tag.v.split_once(" - ") else {
                warn!(
                    "skipping bilingual value without ' - ' separator: {:?}",
                    tag.v
                );
                continue;
            };
            if left.is_empty() || right.is_empty() {
                warn!("skipping malformed bilingual value: {:?}", tag.v);
                continue;
            }
            // Last write wins when two bilingual pairs share a component
            // (two cities both shortened to "Centre" map to whichever pair
            // the file mentions last). Known correctness gap, kept as is.
            names.insert(tag.v.clone(), tag.v.clone());
            names.insert(left.to_string(), tag.v.clone());
            names.insert(right.to_string(), tag.v.clone());
            names.insert(format!("{right} - {left}"), tag.v.clone());
        }
    }
    Ok(names)
}

/// Re-encodes the value of every tag whose key contains `key`.
fn fix_encoding(tag: &mut Tag, key: &str) {
    if tag.k.contains(key) {
        tag.v = normalize_encoding(&tag.v);
    }
}

/// Replaces the value of a `key` tag with its canonical bilingual form, if
/// the dictionary knows the current value as a variant.
fn fix_names(tag: &mut Tag, key: &str, fixes: &VariantDict) {
    if is_address(tag, key) {
        if let Some(canonical) = fixes.get(&tag.v) {
            tag.v = canonical.clone();
        }
    }
}

fn write_element<W: IoWrite>(out: &mut W, element: &Element) -> io::Result<()> {
    write!(out, "  <{}", element.kind)?;
    for (name, value) in &element.attrs {
        write!(out, " {}=\"{}\"", name, escape(value))?;
    }
    if element.children.is_empty() {
        return writeln!(out, "/>");
    }
    writeln!(out, ">")?;
    for child in &element.children {
        match child {
            Child::Tag(tag) => {
                writeln!(
                    out,
                    "    <tag k=\"{}\" v=\"{}\"/>",
                    escape(&tag.k),
                    escape(&tag.v)
                )?;
            }
            Child::Other { name, attrs } => {
                write!(out, "    <{name}")?;
                for (attr, value) in attrs {
                    write!(out, " {}=\"{}\"", attr, escape(value))?;
                }
                writeln!(out, "/>")?;
            }
            Child::Text(text) => writeln!(out, "    {}", escape(text))?,
        }
    }
    writeln!(out, "  </{}>", element.kind)
}

/// Streams the file a second time, applies `fix` to every tag of every
/// element and writes the result to a scratch file in the same directory,
/// wrapped in a fresh declaration and `<osm>` container. Only once the
/// scratch file is complete is it atomically persisted over the original;
/// any earlier failure leaves the original untouched. Returns the number of
/// elements written.
fn rewrite<F: FnMut(&mut Tag)>(path: &Path, mut fix: F) -> Result<u64> {
    let reader = ElementReader::open(path)?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut scratch = NamedTempFile::new_in(dir)?;
    let mut count = 0u64;
    {
        let mut out = BufWriter::new(scratch.as_file_mut());
        out.write_all(b"<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<osm>\n")?;
        for element in reader {
            let mut element = element?;
            for tag in element.tags_mut() {
                fix(tag);
            }
            write_element(&mut out, &element)?;
            count += 1;
        }
        out.write_all(b"</osm>\n")?;
        out.flush()?;
    }
    scratch.persist(path)?;
    info!("rewrote {count} elements in {}", path.display());
    Ok(count)
}

/// Frequency of every value recorded under `key`.
fn name_counts(path: &Path, key: &str) -> Result<BTreeMap<String, u64>> {
    let mut names = BTreeMap::new();
    for element in ElementReader::open(path)? {
        let element = element?;
        for tag in element.tags() {
            if is_address(tag, key) {
                *names.entry(tag.v.clone()).or_insert(0) += 1;
            }
        }
    }
    Ok(names)
}

/// Frequency of `key` values containing a problem character.
fn problem_counts(path: &Path, key: &str) -> Result<BTreeMap<String, u64>> {
    let mut problems = BTreeMap::new();
    for element in ElementReader::open(path)? {
        let element = element?;
        for tag in element.tags() {
            if is_address(tag, key) && PROBLEM_CHARS.is_match(&tag.v) {
                *problems.entry(tag.v.clone()).or_insert(0) += 1;
            }
        }
    }
    Ok(problems)
}

/// Census of naming conventions: bilingual vs monolingual counts for the
/// combined address keys, plus counts for the dedicated per-language keys.
fn convention_counts(path: &Path) -> Result<BTreeMap<String, u64>> {
    let mut counts: BTreeMap<String, u64> = BTreeMap::new();
    for element in ElementReader::open(path)? {
        let element = element?;
        for tag in element.tags() {
            if ADDRESS_KEYS.contains(&tag.k.as_str()) {
                let form = if BILINGUAL_DASH.is_match(&tag.v) {
                    "bi"
                } else {
                    "mono"
                };
                *counts.entry(format!("{}:{form}", tag.k)).or_insert(0) += 1;
            }
            if LANGUAGE_KEYS.contains(&tag.k.as_str()) {
                *counts.entry(tag.k.clone()).or_insert(0) += 1;
            }
        }
    }
    // Elements with dedicated per-language tags also carry a combined tag,
    // so the totals only sum the mono and bi counts.
    let total = |counts: &BTreeMap<String, u64>, key: &str| {
        counts.get(&format!("{key}:bi")).copied().unwrap_or(0)
            + counts.get(&format!("{key}:mono")).copied().unwrap_or(0)
    };
    let city_total = total(&counts, "addr:city");
    let street_total = total(&counts, "addr:street");
    counts.insert("city_total".to_string(), city_total);
    counts.insert("street_total".to_string(), street_total);
    Ok(counts)
}

fn write_counts_to<W: io::Write>(
    counts: &BTreeMap<String, u64>,
    mut writer: Writer<W>,
    header: [&str; 2],
) -> Result<()> {
    writer.write_record(header)?;
    for (name, count) in counts {
        writer.write_record([name.as_str(), count.to_string().as_str()])?;
    }
    writer.flush()?;
    Ok(())
}

fn write_counts(
    counts: &BTreeMap<String, u64>,
    output: Option<&Path>,
    header: [&str; 2],
) -> Result<()> {
    match output {
        Some(path) => write_counts_to(counts, Writer::from_path(path)?, header),
        None => write_counts_to(counts, Writer::from_writer(io::stdout().lock()), header),
    }
}

enum Command {
    FixNames {
        input: PathBuf,
        key: String,
    },
    FixEncoding {
        input: PathBuf,
        key: String,
    },
    Names {
        input: PathBuf,
        key: String,
        output: Option<PathBuf>,
    },
    Problems {
        input: PathBuf,
        key: String,
        output: Option<PathBuf>,
    },
    Conventions {
        input: PathBuf,
        output: Option<PathBuf>,
    },
}

const USAGE: &str = "\
Usage: clean_osm_names COMMAND [OPTIONS]

Commands:
  fix-names     Rewrite city or street names to their canonical bilingual form
  fix-encoding  Strip diacritics from tag values whose key contains --key
  names         Report value frequencies for a tag key (CSV)
  problems      Report values containing problem characters (CSV)
  conventions   Report bilingual/monolingual naming census (CSV)

Options:
  --input FILE   Path to the OSM XML extract (required)
  --key KEY      Tag key to target, e.g. addr:city or addr:street
  --output FILE  Write report CSV to FILE instead of stdout";

fn require(value: Option<String>, flag: &str) -> Result<String> {
    value.ok_or_else(|| format!("{flag} is required").into())
}

fn parse_args() -> Result<Command> {
    let mut args = env::args().skip(1);
    let command = args.next().ok_or(USAGE)?;

    let mut input = None;
    let mut key = None;
    let mut output = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--input" => {
                input = Some(
                    args.next()
                        .ok_or("--input requires a path")
                        .map(PathBuf::from)?,
                );
            }
            "--key" => {
                key = Some(args.next().ok_or("--key requires a tag key")?);
            }
            "--output" => {
                output = args
                    .next()
                    .ok_or("--output requires a path")
                    .map(PathBuf::from)
                    .map(Some)?;
            }
            "-h" | "--help" => {
                println!("{USAGE}");
                std::process::exit(0);
            }
            _ => return Err(format!("unknown argument: {arg}").into()),
        }
    }

    let input = input.ok_or("--input is required")?;
    match command.as_str() {
        "fix-names" => Ok(Command::FixNames {
            input,
            key: require(key, "--key")?,
        }),
        "fix-encoding" => Ok(Command::FixEncoding {
            input,
            key: require(key, "--key")?,
        }),
        "names" => Ok(Command::Names {
            input,
            key: require(key, "--key")?,
            output,
        }),
        "problems" => Ok(Command::Problems {
            input,
            key: require(key, "--key")?,
            output,
        }),
        "conventions" => Ok(Command::Conventions { input, output }),
        _ => Err(format!("unknown command: {command}").into()),
    }
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let _logger = flexi_logger::Logger::try_with_env_or_str("info")?.start()?;
    match parse_args()? {
        Command::FixNames { input, key } => {
            let fixes = build_dict(&input, &key)?;
            info!("built {} variant mappings for {key}", fixes.len());
            rewrite(&input, |tag| fix_names(tag, &key, &fixes))?;
            Ok(())
        }
        Command::FixEncoding { input, key } => {
            rewrite(&input, |tag| fix_encoding(tag, &key))?;
            Ok(())
        }
        Command::Names { input, key, output } => {
            let counts = name_counts(&input, &key)?;
            write_counts(&counts, output.as_deref(), ["value", "count"])
        }
        Command::Problems { input, key, output } => {
            let counts = problem_counts(&input, &key)?;
            write_counts(&counts, output.as_deref(), ["value", "count"])
        }
        Command::Conventions { input, output } => {
            let counts = convention_counts(&input)?;
            write_counts(&counts, output.as_deref(), ["convention", "count"])
        }
    }
}
