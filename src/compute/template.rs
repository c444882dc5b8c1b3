//! Template substitution: renders parameter values into simulator input files.
//!
//! Placeholders follow printf-style mapping keys: `%(NAME)f`, `%(NAME).3f`,
//! `%(NAME)12.4e`, `%(NAME)-8g`, `%(NAME)i` and so on. Conversions are
//! `f F e E g G d i u` with the usual `- + space # 0` flags, width and precision;
//! any other conversion is rejected. Placeholders may embed defaults
//! (`%(NAME, LOW, HIGH)f`); the numbers follow the parameter grammar, so
//! `%(NAME, VALUE)f` and `%(NAME, VALUE, LOW, HIGH)f` are accepted too.
//! Lines whose first non-blank character is `#` are copied verbatim, and `%%`
//! renders as a single `%`.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::schema::{Parameter, ParameterKind, ParameterSpecError, parse_parameter};

/// Prefix marking template files; dropped from the rendered file name.
pub const TEMPLATE_PREFIX: &str = "template.";

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"%%|%\(\s*(?P<name>\w+)\s*(?:,(?P<data>[^)]*))?\)(?P<flags>[-+ #0]*)(?P<width>\d*)(?:\.(?P<prec>\d*))?(?P<conv>[A-Za-z]?)",
    )
    .expect("placeholder pattern is a valid regex")
});

const CONVERSIONS: &str = "fFeEgGdiu";

/// Conversion flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags {
    /// `-`
    pub left_align: bool,
    /// `+`
    pub plus: bool,
    /// ` `
    pub space: bool,
    /// `#`
    pub alternate: bool,
    /// `0`
    pub zero_pad: bool,
}

/// Numeric formatting of a placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Directive {
    pub flags: Flags,
    pub width: usize,
    pub precision: Option<usize>,
    /// One of `f F e E g G d i u`.
    pub conversion: char,
}

impl Directive {
    /// Parse flags, width, precision and conversion; `None` for unsupported
    /// conversions.
    fn parse(flags: &str, width: &str, precision: Option<&str>, conversion: &str) -> Option<Self> {
        let conversion = conversion.chars().next().filter(|c| CONVERSIONS.contains(*c))?;
        Some(Self {
            flags: Flags {
                left_align: flags.contains('-'),
                plus: flags.contains('+'),
                space: flags.contains(' '),
                alternate: flags.contains('#'),
                zero_pad: flags.contains('0'),
            },
            width: width.parse().unwrap_or(0),
            precision: precision.map(|p| p.parse().unwrap_or(0)),
            conversion,
        })
    }

    /// Integer conversions truncate toward zero.
    pub fn is_integer(self) -> bool {
        matches!(self.conversion, 'd' | 'i' | 'u')
    }

    /// Format a value under this directive.
    pub fn format(self, value: f64) -> String {
        let upper = self.conversion.is_ascii_uppercase();
        let negative;
        let mut digits = if !value.is_finite() {
            negative = value < 0.0;
            let text = if value.is_nan() { "nan" } else { "inf" };
            if upper { text.to_uppercase() } else { text.to_string() }
        } else if self.is_integer() {
            let int = value.trunc() as i64;
            negative = int < 0;
            let magnitude = int.unsigned_abs().to_string();
            let min = self.precision.unwrap_or(0);
            format!("{}{magnitude}", "0".repeat(min.saturating_sub(magnitude.len())))
        } else {
            negative = value.is_sign_negative();
            let magnitude = value.abs();
            let precision = self.precision.unwrap_or(6);
            match self.conversion.to_ascii_lowercase() {
                'e' => exponent(magnitude, precision, self.flags.alternate, upper),
                'g' => general(magnitude, precision, self.flags.alternate, upper),
                _ => fixed(magnitude, precision, self.flags.alternate),
            }
        };

        let sign = if negative {
            "-"
        } else if self.flags.plus {
            "+"
        } else if self.flags.space {
            " "
        } else {
            ""
        };
        let fill = self.width.saturating_sub(sign.len() + digits.len());
        if self.flags.left_align {
            digits.push_str(&" ".repeat(fill));
            format!("{sign}{digits}")
        } else if self.flags.zero_pad && value.is_finite() {
            format!("{sign}{}{digits}", "0".repeat(fill))
        } else {
            format!("{}{sign}{digits}", " ".repeat(fill))
        }
    }
}

/// Reproduces the directive text after the closing parenthesis.
impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flags = [
            (self.flags.left_align, '-'),
            (self.flags.plus, '+'),
            (self.flags.space, ' '),
            (self.flags.alternate, '#'),
            (self.flags.zero_pad, '0'),
        ];
        for (set, c) in flags {
            if set {
                write!(f, "{c}")?;
            }
        }
        if self.width > 0 {
            write!(f, "{}", self.width)?;
        }
        if let Some(p) = self.precision {
            write!(f, ".{p}")?;
        }
        write!(f, "{}", self.conversion)
    }
}

fn fixed(magnitude: f64, precision: usize, alternate: bool) -> String {
    let mut text = format!("{magnitude:.precision$}");
    if alternate && precision == 0 {
        text.push('.');
    }
    text
}

/// Mantissa and exponent with at least two exponent digits: `1.5e+00`.
fn exponent(magnitude: f64, precision: usize, alternate: bool, upper: bool) -> String {
    let (mut mantissa, exp) = split_exponent(magnitude, precision);
    if alternate && precision == 0 {
        mantissa.push('.');
    }
    join_exponent(&mantissa, exp, upper)
}

/// Fixed or exponent notation, whichever is shorter for `precision`
/// significant digits; trailing zeros are dropped unless `alternate`.
fn general(magnitude: f64, precision: usize, alternate: bool, upper: bool) -> String {
    let significant = precision.max(1);
    let (_, exp) = split_exponent(magnitude, significant - 1);
    if exp < -4 || exp >= significant as i32 {
        let (mut mantissa, exp) = split_exponent(magnitude, significant - 1);
        if !alternate {
            trim_zeros(&mut mantissa);
        }
        join_exponent(&mantissa, exp, upper)
    } else {
        let decimals = (significant as i32 - 1 - exp).max(0) as usize;
        let mut text = format!("{magnitude:.decimals$}");
        if !alternate {
            trim_zeros(&mut text);
        } else if decimals == 0 {
            text.push('.');
        }
        text
    }
}

fn split_exponent(magnitude: f64, precision: usize) -> (String, i32) {
    let text = format!("{magnitude:.precision$e}");
    match text.split_once('e') {
        Some((mantissa, exp)) => (mantissa.to_string(), exp.parse().unwrap_or(0)),
        None => (text, 0),
    }
}

fn join_exponent(mantissa: &str, exp: i32, upper: bool) -> String {
    let e = if upper { 'E' } else { 'e' };
    let sign = if exp < 0 { '-' } else { '+' };
    format!("{mantissa}{e}{sign}{:02}", exp.unsigned_abs())
}

fn trim_zeros(text: &mut String) {
    if text.contains('.') {
        let kept = text.trim_end_matches('0').trim_end_matches('.').len();
        text.truncate(kept);
    }
}

/// A placeholder found in a template.
#[derive(Debug, Clone, PartialEq)]
pub struct Placeholder {
    /// Parameter name.
    pub name: String,
    /// Formatting directive.
    pub directive: Directive,
    /// Declaration built from embedded numbers, if any.
    pub default: Option<Parameter>,
    /// One-based line number.
    pub line: usize,
}

/// Visit every placeholder of non-comment lines.
///
/// The callback receives the placeholder (or `None` for `%%`) and returns the
/// replacement text; the rendered text is returned.
fn substitute<F>(template: &str, mut replace: F) -> Result<String, TemplateError>
where
    F: FnMut(Option<Placeholder>) -> Result<String, TemplateError>,
{
    let mut out = String::with_capacity(template.len());
    for (index, line) in template.split_inclusive('\n').enumerate() {
        if line.trim_start().starts_with('#') {
            out.push_str(line);
            continue;
        }
        let mut last = 0;
        for caps in PLACEHOLDER.captures_iter(line) {
            let Some(whole) = caps.get(0) else { continue };
            out.push_str(&line[last..whole.start()]);
            let placeholder = match caps.name("name") {
                Some(_) => Some(placeholder_from(&caps, index + 1)?),
                None => None,
            };
            out.push_str(&replace(placeholder)?);
            last = whole.end();
        }
        out.push_str(&line[last..]);
    }
    Ok(out)
}

fn placeholder_from(caps: &Captures<'_>, line: usize) -> Result<Placeholder, TemplateError> {
    let name = caps["name"].to_string();
    let directive = Directive::parse(
        &caps["flags"],
        &caps["width"],
        caps.name("prec").map(|p| p.as_str()),
        &caps["conv"],
    )
    .ok_or_else(|| TemplateError::UnsupportedFormat {
        line,
        text: caps[0].to_string(),
    })?;
    let default = match caps.name("data") {
        Some(data) => Some(embedded_declaration(&name, data.as_str(), directive).map_err(
            |source| TemplateError::MalformedPlaceholder {
                line,
                text: caps[0].to_string(),
                source,
            },
        )?),
        None => None,
    };
    Ok(Placeholder {
        name,
        directive,
        default,
        line,
    })
}

/// Build a parameter declaration from the numbers embedded in a placeholder.
fn embedded_declaration(
    name: &str,
    data: &str,
    directive: Directive,
) -> Result<Parameter, ParameterSpecError> {
    let words: Vec<&str> = data.split(',').map(str::trim).collect();
    let declared = parse_parameter(&format!("{name} {}", words.join(" ")))?;
    if !directive.is_integer() {
        return Ok(declared);
    }
    let mut value = declared.value().round();
    if let Some(lo) = declared.minv() {
        value = value.max(lo.ceil());
    }
    if let Some(hi) = declared.maxv() {
        value = value.min(hi.floor());
    }
    Parameter::new(
        name,
        value,
        declared.minv(),
        declared.maxv(),
        ParameterKind::Integer,
    )
}

/// List placeholders in order of appearance.
pub fn placeholders(template: &str) -> Result<Vec<Placeholder>, TemplateError> {
    let mut found = Vec::new();
    substitute(template, |p| {
        if let Some(p) = p {
            found.push(p);
        }
        Ok(String::new())
    })?;
    Ok(found)
}

/// Render a template with the given parameter values.
///
/// Placeholders naming an absent parameter fall back to their embedded
/// default; without one the render fails with `MissingParameter`.
pub fn render(template: &str, values: &BTreeMap<String, f64>) -> Result<String, TemplateError> {
    substitute(template, |p| match p {
        None => Ok("%".to_string()),
        Some(p) => {
            let value = values
                .get(&p.name)
                .copied()
                .or_else(|| p.default.as_ref().map(Parameter::value))
                .ok_or_else(|| TemplateError::MissingParameter {
                    name: p.name.clone(),
                    line: p.line,
                })?;
            Ok(p.directive.format(value))
        }
    })
}

/// Parameter declarations embedded in a template, first occurrence wins.
pub fn discover_parameters(template: &str) -> Result<Vec<Parameter>, TemplateError> {
    let mut parameters: Vec<Parameter> = Vec::new();
    for p in placeholders(template)? {
        if let Some(declared) = p.default
            && parameters.iter().all(|q| q.name() != declared.name())
        {
            parameters.push(declared);
        }
    }
    Ok(parameters)
}

/// Remove embedded defaults, leaving plain `%(NAME)f` placeholders.
pub fn strip_defaults(template: &str) -> Result<String, TemplateError> {
    substitute(template, |p| match p {
        None => Ok("%%".to_string()),
        Some(p) => Ok(format!("%({}){}", p.name, p.directive)),
    })
}

/// Output path for a template: the file name without its `template.` prefix.
pub fn rendered_path(source: &Path) -> Result<PathBuf, TemplateError> {
    let name = source
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.strip_prefix(TEMPLATE_PREFIX))
        .filter(|n| !n.is_empty())
        .ok_or_else(|| TemplateError::NoTargetName(source.to_path_buf()))?;
    Ok(source.with_file_name(name))
}

/// Render `source` into `target` (or the derived name when `target` is `None`).
pub fn render_file(
    source: &Path,
    target: Option<&Path>,
    values: &BTreeMap<String, f64>,
) -> Result<PathBuf, TemplateError> {
    let target = match target {
        Some(t) => t.to_path_buf(),
        None => rendered_path(source)?,
    };
    let text = fs::read_to_string(source).map_err(|source_err| TemplateError::Io {
        path: source.to_path_buf(),
        source: source_err,
    })?;
    let rendered = render(&text, values)?;
    fs::write(&target, rendered).map_err(|source| TemplateError::Io {
        path: target.clone(),
        source,
    })?;
    log::debug!("Rendered {} -> {}", source.display(), target.display());
    Ok(target)
}

/// Template errors.
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("Line {line}: placeholder references unknown parameter '{name}' and has no default")]
    MissingParameter { name: String, line: usize },
    #[error("Line {line}: malformed placeholder '{text}': {source}")]
    MalformedPlaceholder {
        line: usize,
        text: String,
        source: ParameterSpecError,
    },
    #[error("Line {line}: unsupported conversion in '{text}'")]
    UnsupportedFormat { line: usize, text: String },
    #[error("Cannot derive output name for {0}: expected a 'template.' prefix")]
    NoTargetName(PathBuf),
    #[error("Template I/O on {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn values(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_render_formats() {
        let text = "r0 = %(r0)f\nn = %(n)i\nx = %(x).3f\n";
        let out = render(text, &values(&[("r0", 1.5), ("n", 15.0), ("x", 2.0)])).unwrap();
        assert_eq!(out, "r0 = 1.500000\nn = 15\nx = 2.000\n");

        let out = render("%(a)f %(a)i", &values(&[("a", 27.9)])).unwrap();
        assert_eq!(out, "27.900000 27");
    }

    #[test]
    fn test_printf_conversions() {
        let vals = values(&[("x", 1.5), ("y", -0.000123456), ("n", 7.9), ("big", 1234567.0)]);
        let cases = [
            ("%(x)e", "1.500000e+00"),
            ("%(x).2E", "1.50E+00"),
            ("%(y).3e", "-1.235e-04"),
            ("%(x)10.4f", "    1.5000"),
            ("%(x)-8.1f|", "1.5     |"),
            ("%(x)+.2f", "+1.50"),
            ("%(y)09.5f", "-00.00012"),
            ("%(n)d", "7"),
            ("%(n)u", "7"),
            ("%(n)4i", "   7"),
            ("%(n).3d", "007"),
            ("%(x)g", "1.5"),
            ("%(y)g", "-0.000123456"),
            ("%(big)g", "1.23457e+06"),
            ("%(big).3G", "1.23E+06"),
            ("%(x)#g", "1.50000"),
            ("%(x).0f", "2"),
        ];
        for (text, expected) in cases {
            assert_eq!(render(text, &vals).unwrap(), expected, "{text}");
        }
    }

    #[test]
    fn test_unsupported_conversion() {
        for text in ["a %(x)s", "%(x)x", "b\n%(x)10"] {
            let err = render(text, &values(&[("x", 1.0)])).unwrap_err();
            assert!(matches!(err, TemplateError::UnsupportedFormat { .. }), "{text}");
        }
        let err = placeholders("ok %(x)f\nbad %(y)r\n").unwrap_err();
        assert!(matches!(err, TemplateError::UnsupportedFormat { line: 2, .. }));
    }

    #[test]
    fn test_comment_lines_untouched() {
        let text = "# uses %(r0)f\n  # %(missing)f\nv %(r0)f\n";
        let out = render(text, &values(&[("r0", 3.0)])).unwrap();
        assert_eq!(out, "# uses %(r0)f\n  # %(missing)f\nv 3.000000\n");
    }

    #[test]
    fn test_percent_escape() {
        let out = render("100%% of %(a)i", &values(&[("a", 4.0)])).unwrap();
        assert_eq!(out, "100% of 4");
    }

    #[test]
    fn test_missing_parameter() {
        let err = render("a\nb %(nope)f\n", &values(&[])).unwrap_err();
        assert!(matches!(
            err,
            TemplateError::MissingParameter { ref name, line: 2 } if name == "nope"
        ));
    }

    #[test]
    fn test_embedded_default_used() {
        let text = "%(PotCompRad_Si_s, 2, 5)f %(n, 4, 2, 8)i";
        let out = render(text, &values(&[])).unwrap();
        assert_eq!(out, "3.500000 4");

        let out = render(text, &values(&[("PotCompRad_Si_s", 2.25)])).unwrap();
        assert_eq!(out, "2.250000 4");
    }

    #[test]
    fn test_malformed_default() {
        let err = render("%(a, x, 5)f", &values(&[])).unwrap_err();
        assert!(matches!(err, TemplateError::MalformedPlaceholder { line: 1, .. }));
    }

    #[test]
    fn test_discover_and_strip() {
        let text = "# %(skip, 0, 1)f\n%(r_s, 2, 5)f %(r_p , 3, 6)f\n%(r_s, 9, 10)f %(nc, 2, 12)i\n";
        let found = discover_parameters(text).unwrap();
        let names: Vec<_> = found.iter().map(Parameter::name).collect();
        assert_eq!(names, vec!["r_s", "r_p", "nc"]);
        assert_eq!(found[0].bounds(), Some((2.0, 5.0)));
        assert_eq!(found[2].kind(), ParameterKind::Integer);
        assert_eq!(found[2].value(), 7.0);

        let stripped = strip_defaults(text).unwrap();
        assert_eq!(
            stripped,
            "# %(skip, 0, 1)f\n%(r_s)f %(r_p)f\n%(r_s)f %(nc)i\n"
        );
        assert_eq!(
            strip_defaults("%(a, 1, 2)12.4e %(b, 1, 5)-3d").unwrap(),
            "%(a)12.4e %(b)-3d"
        );
    }

    #[test]
    fn test_render_idempotent_and_roundtrip() {
        let text = "a %(a)f\nb %(b).4f\nc %(c)i\n";
        let vals = values(&[("a", -1.234567), ("b", 0.5), ("c", 12.0)]);
        let first = render(text, &vals).unwrap();
        let second = render(text, &vals).unwrap();
        assert_eq!(first, second);

        let recovered: Vec<f64> = first
            .lines()
            .map(|l| l.split_whitespace().nth(1).unwrap().parse().unwrap())
            .collect();
        assert!((recovered[0] - vals["a"]).abs() <= 5e-7);
        assert!((recovered[1] - vals["b"]).abs() <= 5e-5);
        assert_eq!(recovered[2], vals["c"]);
    }

    #[test]
    fn test_rendered_path() {
        assert_eq!(
            rendered_path(Path::new("skf/template.skdefs.py")).unwrap(),
            PathBuf::from("skf/skdefs.py")
        );
        assert!(rendered_path(Path::new("skdefs.py")).is_err());
    }

    #[test]
    fn test_render_file() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("template.in");
        fs::write(&source, "x = %(x)f\n").unwrap();

        let out = render_file(&source, None, &values(&[("x", 0.25)])).unwrap();
        assert_eq!(out, dir.path().join("in"));
        assert_eq!(fs::read_to_string(&out).unwrap(), "x = 0.250000\n");

        let explicit = dir.path().join("other.in");
        render_file(&source, Some(&explicit), &values(&[("x", 1.0)])).unwrap();
        assert_eq!(fs::read_to_string(&explicit).unwrap(), "x = 1.000000\n");
    }
}
