//! Query/extractor layer: turns a simulator output file into named observables.
//!
//! Extractors form a closed set resolved by name once at startup
//! ([`resolve_extractor`]). Every accessor reports a missing quantity as `None`
//! and missing observables are simply absent from the [`ObservableMap`]; nothing
//! is ever defaulted to a plausible-looking number.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::schema::{ExtractorConfig, TableColumn};

/// Named observables produced by one task execution.
pub type ObservableMap = BTreeMap<String, f64>;

/// Parses a task's output into observables.
pub trait QueryExtractor: Send + Sync + fmt::Debug {
    /// Registered extractor name.
    fn kind(&self) -> &'static str;
    /// Output file, relative to the task directory.
    fn output_file(&self) -> &Path;
    /// Extract observables from the task directory.
    fn extract(&self, dir: &Path) -> Result<ObservableMap, QueryError>;
}

type Builder = fn(&ExtractorConfig) -> Result<Box<dyn QueryExtractor>, QueryError>;

/// Name -> implementation lookup table.
const EXTRACTORS: &[(&str, Builder)] = &[
    ("DetailedOut", build_detailed_out),
    ("KeyValue", build_key_value),
    ("Table", build_table),
];

/// Names of all registered extractors.
pub fn extractor_kinds() -> Vec<&'static str> {
    EXTRACTORS.iter().map(|(name, _)| *name).collect()
}

/// Resolve an extractor configuration to its implementation.
pub fn resolve_extractor(config: &ExtractorConfig) -> Result<Box<dyn QueryExtractor>, QueryError> {
    let builder = EXTRACTORS
        .iter()
        .find(|(name, _)| *name == config.kind)
        .map(|(_, build)| *build)
        .ok_or_else(|| QueryError::UnknownKind {
            kind: config.kind.clone(),
            known: extractor_kinds().join(", "),
        })?;
    builder(config)
}

fn build_detailed_out(config: &ExtractorConfig) -> Result<Box<dyn QueryExtractor>, QueryError> {
    Ok(Box::new(DetailedOutExtractor {
        file: config
            .file
            .clone()
            .unwrap_or_else(|| PathBuf::from(DETAILED_OUT)),
        require_convergence: config.require_convergence,
    }))
}

fn build_key_value(config: &ExtractorConfig) -> Result<Box<dyn QueryExtractor>, QueryError> {
    Ok(Box::new(KeyValueExtractor {
        file: required_file(config)?,
    }))
}

fn build_table(config: &ExtractorConfig) -> Result<Box<dyn QueryExtractor>, QueryError> {
    if config.columns.is_empty() {
        return Err(QueryError::NoColumns);
    }
    Ok(Box::new(TableExtractor {
        file: required_file(config)?,
        columns: config.columns.clone(),
    }))
}

fn required_file(config: &ExtractorConfig) -> Result<PathBuf, QueryError> {
    config.file.clone().ok_or_else(|| QueryError::MissingFileSetting {
        kind: config.kind.clone(),
    })
}

fn read_output(path: &Path) -> Result<String, QueryError> {
    fs::read_to_string(path).map_err(|source| match source.kind() {
        io::ErrorKind::NotFound => QueryError::OutputMissing(path.to_path_buf()),
        _ => QueryError::Io {
            path: path.to_path_buf(),
            source,
        },
    })
}

fn parse_number(token: Option<&str>, line: usize, what: &str) -> Result<f64, QueryError> {
    token
        .and_then(|t| t.parse::<f64>().ok())
        .ok_or_else(|| QueryError::Malformed {
            line,
            reason: format!("expected a number for {what}, found {:?}", token.unwrap_or("")),
        })
}

// ============================================================================
// Detailed output of a self-consistent tight-binding calculation
// ============================================================================

/// Default name of the detailed report.
pub const DETAILED_OUT: &str = "detailed.out";

/// Energy components of a detailed report (values in eV).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Energy {
    Fermi,
    Band,
    Ts,
    BandFree,
    ExtrapolatedZero,
    H0,
    Scc,
    SpinOrbit,
    Electronic,
    Repulsive,
    Total,
    Mermin,
}

impl Energy {
    pub const ALL: [Energy; 12] = [
        Energy::Fermi,
        Energy::Band,
        Energy::Ts,
        Energy::BandFree,
        Energy::ExtrapolatedZero,
        Energy::H0,
        Energy::Scc,
        Energy::SpinOrbit,
        Energy::Electronic,
        Energy::Repulsive,
        Energy::Total,
        Energy::Mermin,
    ];

    /// Observable key.
    pub fn key(self) -> &'static str {
        match self {
            Energy::Fermi => "Ef",
            Energy::Band => "Eband",
            Energy::Ts => "Ets",
            Energy::BandFree => "Ebf",
            Energy::ExtrapolatedZero => "E0K",
            Energy::H0 => "Eh0",
            Energy::Scc => "Escc",
            Energy::SpinOrbit => "Els",
            Energy::Electronic => "Eel",
            Energy::Repulsive => "Erep",
            Energy::Total => "Etot",
            Energy::Mermin => "Emermin",
        }
    }

    /// Line labels announcing this component.
    fn labels(self) -> &'static [&'static str] {
        match self {
            Energy::Fermi => &["Fermi energy:", "Fermi level:"],
            Energy::Band => &["Band energy:"],
            Energy::Ts => &["TS:"],
            Energy::BandFree => &["Band free energy (E-TS):"],
            Energy::ExtrapolatedZero => &["Extrapolated E(0K):"],
            Energy::H0 => &["Energy H0:"],
            Energy::Scc => &["Energy SCC:"],
            Energy::SpinOrbit => &["Energy L.S:"],
            Energy::Electronic => &["Total Electronic energy:"],
            Energy::Repulsive => &["Repulsive energy:"],
            Energy::Total => &["Total energy:"],
            Energy::Mermin => &["Total Mermin free energy:"],
        }
    }

    /// Look up a component by observable key or by report label.
    pub fn from_label(label: &str) -> Option<Energy> {
        let label = label.trim().trim_end_matches(':');
        Energy::ALL.into_iter().find(|e| {
            e.key() == label
                || e
                    .labels()
                    .iter()
                    .any(|l| l.trim_end_matches(':').eq_ignore_ascii_case(label))
        })
    }
}

/// Accessors every self-consistent report provides.
pub trait ScfReport {
    /// Convergence of the self-consistent cycle; `None` if the report does not say.
    fn scc_converged(&self) -> Option<bool>;
    /// An energy component; `None` if absent or not trustworthy.
    fn energy(&self, component: Energy) -> Option<f64>;
    /// Nominal (input) electron count.
    fn input_electrons(&self) -> Option<f64>;
    /// Converged (output) electron count.
    fn output_electrons(&self) -> Option<f64>;
    /// Neutral-atom reference charge.
    fn neutral_charge(&self) -> Option<f64>;
    /// Total current between two contacts.
    fn current(&self, contacts: (u32, u32)) -> Option<f64>;
    /// Whether spin-orbit coupling was included.
    fn with_soc(&self) -> bool;

    /// Input charge; identical to the input electron count.
    fn input_charge(&self) -> Option<f64> {
        self.input_electrons()
    }

    /// Output charge; identical to the output electron count.
    fn output_charge(&self) -> Option<f64> {
        self.output_electrons()
    }

    /// Current between the default contacts (1, 2).
    fn default_current(&self) -> Option<f64> {
        self.current((1, 2))
    }
}

/// Parsed detailed report.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetailedOut {
    energies: BTreeMap<Energy, f64>,
    electrons: Option<(f64, f64)>,
    charges: Option<(f64, f64)>,
    neutral_charge: Option<f64>,
    converged: Option<bool>,
    currents: BTreeMap<(u32, u32), f64>,
    require_convergence: bool,
}

impl DetailedOut {
    /// Parse report text. Energies of a non-converged report are withheld.
    pub fn parse(text: &str) -> Result<Self, QueryError> {
        let mut out = Self {
            require_convergence: true,
            ..Self::default()
        };
        let mut recognized = false;

        for (index, raw) in text.lines().enumerate() {
            let line = raw.trim();
            let lineno = index + 1;
            let words: Vec<&str> = line.split_whitespace().collect();
            let from_end = |n: usize| words.len().checked_sub(n).map(|i| words[i]);

            if let Some(energy) = Energy::ALL
                .into_iter()
                .find(|e| e.labels().iter().any(|l| line.starts_with(l)))
            {
                // Penultimate word is the value in eV.
                let value = parse_number(from_end(2), lineno, energy.key())?;
                out.energies.insert(energy, value);
                recognized = true;
            } else if line.starts_with("Input/Output electrons (q):")
                || line.starts_with("Input / Output electrons (q):")
            {
                let input = parse_number(from_end(2), lineno, "input electrons")?;
                let output = parse_number(from_end(1), lineno, "output electrons")?;
                out.electrons = Some((input, output));
                recognized = true;
            } else if line.starts_with("Input/Output charge") {
                let input = parse_number(from_end(2), lineno, "input charge")?;
                let output = parse_number(from_end(1), lineno, "output charge")?;
                out.charges = Some((input, output));
                recognized = true;
            } else if line.starts_with("Neutral charge") {
                out.neutral_charge = Some(parse_number(from_end(1), lineno, "neutral charge")?);
                recognized = true;
            } else if line.starts_with("SCC is NOT converged") {
                out.converged = Some(false);
                recognized = true;
            } else if line.starts_with("SCC converged") {
                out.converged = Some(true);
                recognized = true;
            } else if line.starts_with("Total Current") {
                let contacts = parse_contacts(line).ok_or_else(|| QueryError::Malformed {
                    line: lineno,
                    reason: format!("cannot read contact pair from {line:?}"),
                })?;
                let value = parse_number(from_end(2), lineno, "total current")?;
                out.currents.insert(contacts, value);
                recognized = true;
            }
        }

        if !recognized {
            return Err(QueryError::Malformed {
                line: 0,
                reason: "no recognizable report content".to_string(),
            });
        }
        Ok(out)
    }

    /// Read and parse a report file.
    pub fn from_file(path: &Path) -> Result<Self, QueryError> {
        let text = read_output(path)?;
        Self::parse(&text).map_err(|e| e.in_file(path))
    }

    /// Allow energies from non-converged reports.
    pub fn with_convergence_required(mut self, required: bool) -> Self {
        self.require_convergence = required;
        self
    }

    /// All available quantities as observables.
    pub fn observables(&self) -> ObservableMap {
        let mut map = ObservableMap::new();
        for energy in Energy::ALL {
            if let Some(value) = self.energy(energy) {
                map.insert(energy.key().to_string(), value);
            }
        }
        if let Some(nei) = self.input_electrons() {
            map.insert("nei".to_string(), nei);
        }
        if let Some(neo) = self.output_electrons() {
            map.insert("neo".to_string(), neo);
        }
        if let Some(q0) = self.neutral_charge() {
            map.insert("neutral_charge".to_string(), q0);
        }
        if let Some(converged) = self.scc_converged() {
            map.insert("converged".to_string(), if converged { 1.0 } else { 0.0 });
        }
        map.insert(
            "withSOC".to_string(),
            if self.with_soc() { 1.0 } else { 0.0 },
        );
        for (&(c1, c2), &value) in &self.currents {
            map.insert(format!("TotalCurrent({c1}-{c2})"), value);
        }
        map
    }
}

impl ScfReport for DetailedOut {
    fn scc_converged(&self) -> Option<bool> {
        self.converged
    }

    fn energy(&self, component: Energy) -> Option<f64> {
        if self.require_convergence && self.converged == Some(false) {
            return None;
        }
        self.energies.get(&component).copied()
    }

    fn input_electrons(&self) -> Option<f64> {
        self.electrons.or(self.charges).map(|(input, _)| input)
    }

    fn output_electrons(&self) -> Option<f64> {
        self.electrons.or(self.charges).map(|(_, output)| output)
    }

    fn neutral_charge(&self) -> Option<f64> {
        self.neutral_charge
    }

    fn current(&self, contacts: (u32, u32)) -> Option<f64> {
        self.currents.get(&contacts).copied()
    }

    fn with_soc(&self) -> bool {
        self.energies.contains_key(&Energy::SpinOrbit)
    }
}

/// Read `(a-b)` from a current line.
fn parse_contacts(line: &str) -> Option<(u32, u32)> {
    let open = line.find('(')?;
    let close = open + line[open..].find(')')?;
    let (a, b) = line[open + 1..close].split_once('-')?;
    Some((a.trim().parse().ok()?, b.trim().parse().ok()?))
}

/// Extractor over a detailed report.
#[derive(Debug, Clone)]
pub struct DetailedOutExtractor {
    file: PathBuf,
    require_convergence: bool,
}

impl QueryExtractor for DetailedOutExtractor {
    fn kind(&self) -> &'static str {
        "DetailedOut"
    }

    fn output_file(&self) -> &Path {
        &self.file
    }

    fn extract(&self, dir: &Path) -> Result<ObservableMap, QueryError> {
        let report = DetailedOut::from_file(&dir.join(&self.file))?
            .with_convergence_required(self.require_convergence);
        Ok(report.observables())
    }
}

// ============================================================================
// Generic formats
// ============================================================================

/// `key value`, `key = value` or `key: value` lines; `#` starts a comment.
#[derive(Debug, Clone)]
pub struct KeyValueExtractor {
    file: PathBuf,
}

impl KeyValueExtractor {
    /// Parse key/value text.
    pub fn parse(text: &str) -> Result<ObservableMap, QueryError> {
        let mut map = ObservableMap::new();
        for (index, raw) in text.lines().enumerate() {
            let line = raw.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once(['=', ':'])
                .or_else(|| line.split_once(char::is_whitespace))
                .ok_or_else(|| QueryError::Malformed {
                    line: index + 1,
                    reason: format!("expected 'key value', found {line:?}"),
                })?;
            let key = key.trim();
            let value = parse_number(Some(value.trim()), index + 1, key)?;
            map.insert(key.to_string(), value);
        }
        Ok(map)
    }
}

impl QueryExtractor for KeyValueExtractor {
    fn kind(&self) -> &'static str {
        "KeyValue"
    }

    fn output_file(&self) -> &Path {
        &self.file
    }

    fn extract(&self, dir: &Path) -> Result<ObservableMap, QueryError> {
        let path = dir.join(&self.file);
        let text = read_output(&path)?;
        Self::parse(&text).map_err(|e| e.in_file(&path))
    }
}

/// Whitespace-separated numeric table with named cell picks.
#[derive(Debug, Clone)]
pub struct TableExtractor {
    file: PathBuf,
    columns: Vec<TableColumn>,
}

impl TableExtractor {
    /// Parse table text into rows.
    pub fn parse_rows(text: &str) -> Result<Vec<Vec<f64>>, QueryError> {
        text.lines()
            .enumerate()
            .filter(|(_, l)| {
                let l = l.trim();
                !l.is_empty() && !l.starts_with('#')
            })
            .map(|(index, line)| {
                line.split_whitespace()
                    .map(|t| parse_number(Some(t), index + 1, "table cell"))
                    .collect()
            })
            .collect()
    }

    /// Picked cells; picks outside the table are left out.
    pub fn pick(&self, rows: &[Vec<f64>]) -> ObservableMap {
        self.columns
            .iter()
            .filter_map(|c| {
                let value = rows.get(c.row)?.get(c.column)?;
                Some((c.name.clone(), value * c.scale))
            })
            .collect()
    }
}

impl QueryExtractor for TableExtractor {
    fn kind(&self) -> &'static str {
        "Table"
    }

    fn output_file(&self) -> &Path {
        &self.file
    }

    fn extract(&self, dir: &Path) -> Result<ObservableMap, QueryError> {
        let path = dir.join(&self.file);
        let text = read_output(&path)?;
        let rows = Self::parse_rows(&text).map_err(|e| e.in_file(&path))?;
        Ok(self.pick(&rows))
    }
}

/// Extraction errors.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("Output file {0} does not exist")]
    OutputMissing(PathBuf),
    #[error("Failed to read {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("Line {line}: {reason}")]
    Malformed { line: usize, reason: String },
    #[error("{path}: {source}")]
    InFile {
        path: PathBuf,
        source: Box<QueryError>,
    },
    #[error("Unknown extractor kind '{kind}' (known: {known})")]
    UnknownKind { kind: String, known: String },
    #[error("Extractor '{kind}' needs an output file")]
    MissingFileSetting { kind: String },
    #[error("Table extractor needs at least one column pick")]
    NoColumns,
}

impl QueryError {
    fn in_file(self, path: &Path) -> Self {
        match self {
            Self::Malformed { .. } => Self::InFile {
                path: path.to_path_buf(),
                source: Box::new(self),
            },
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SCC_OUT: &str = "\
Fermi level:                        -0.1189042089 H           -3.2356 eV
Band energy:                       -20.8373548052 H         -567.0004 eV
TS:                                  0.0000000000 H            0.0000 eV
Band free energy (E-TS):           -20.8373548052 H         -567.0004 eV
Extrapolated E(0K):                -20.8373548052 H         -567.0004 eV
Input / Output electrons (q):     32.0000000000     32.0000000000

Energy H0:                         -18.7677568011 H         -510.7031 eV
Energy SCC:                          0.0068305386 H            0.1859 eV
Total Electronic energy:           -18.7609262625 H         -510.5172 eV
Repulsive energy:                    0.0000000000 H            0.0000 eV
Total energy:                      -18.7609262625 H         -510.5172 eV
Total Mermin free energy:          -18.7609262625 H         -510.5172 eV

SCC converged
";

    const SOC_OUT: &str = "\
Fermi energy:                       -0.2452361742 H           -6.6732 eV
Band energy:                        -3.6906066990 H         -100.4265 eV
Input/Output electrons (q):      8.00000000      8.00000000
Energy H0:                          -3.1007438467 H          -84.3758 eV
Energy SCC:                          0.0012132373 H            0.0330 eV
Energy L.S:                         -0.0000146998 H           -0.0004 eV
Total Electronic energy:            -3.0995453092 H          -84.3432 eV
Total energy:                       -3.0995453092 H          -84.3432 eV
SCC converged
";

    const NOT_CONVERGED_OUT: &str = "\
Fermi level:                         0.0364962100 H            0.9931 eV
Band energy:                       -20.7185398452 H         -563.7753 eV
Input / Output electrons (q):     32.0000000000     32.0000000000
Total energy:                      -18.6414882474 H         -507.2571 eV
SCC is NOT converged, maximal SCC iterations exceeded
";

    #[test]
    fn test_scc_report() {
        let report = DetailedOut::parse(SCC_OUT).unwrap();
        assert_eq!(report.scc_converged(), Some(true));
        assert_eq!(report.energy(Energy::Fermi), Some(-3.2356));
        assert_eq!(report.energy(Energy::Band), Some(-567.0004));
        assert_eq!(report.energy(Energy::Total), Some(-510.5172));
        assert_eq!(report.energy(Energy::Electronic), Some(-510.5172));
        assert_eq!(report.energy(Energy::Scc), Some(0.1859));
        assert_eq!(report.input_electrons(), Some(32.0));
        assert_eq!(report.output_charge(), Some(32.0));
        assert!(!report.with_soc());
        assert_eq!(report.energy(Energy::SpinOrbit), None);
        assert_eq!(report.neutral_charge(), None);
        assert_eq!(report.default_current(), None);
        assert_eq!(report.current((2, 3)), None);

        let map = report.observables();
        assert_eq!(map["Etot"], -510.5172);
        assert_eq!(map["Emermin"], -510.5172);
        assert_eq!(map["neo"], 32.0);
        assert_eq!(map["converged"], 1.0);
        assert_eq!(map["withSOC"], 0.0);
        assert!(!map.contains_key("Els"));
    }

    #[test]
    fn test_soc_report() {
        let report = DetailedOut::parse(SOC_OUT).unwrap();
        assert!(report.with_soc());
        assert_eq!(report.energy(Energy::SpinOrbit), Some(-0.0004));
        assert_eq!(report.energy(Energy::Fermi), Some(-6.6732));
        assert_eq!(report.output_electrons(), Some(8.0));
    }

    #[test]
    fn test_not_converged_withholds_energies() {
        let report = DetailedOut::parse(NOT_CONVERGED_OUT).unwrap();
        assert_eq!(report.scc_converged(), Some(false));
        for energy in Energy::ALL {
            assert_eq!(report.energy(energy), None, "{energy:?} should be unavailable");
        }
        // Electron counts are not energies.
        assert_eq!(report.output_electrons(), Some(32.0));

        let map = report.observables();
        assert!(!map.contains_key("Etot"));
        assert_eq!(map["converged"], 0.0);

        let relaxed = report.with_convergence_required(false);
        assert_eq!(relaxed.energy(Energy::Total), Some(-507.2571));
    }

    #[test]
    fn test_charges_and_currents() {
        let text = "\
Input/Output charge   7.95   8.05
Neutral charge        8.0
Total Current (1-2):   1.25E-05  A
Total Current (2-3):  -3.00E-06  A
SCC converged
";
        let report = DetailedOut::parse(text).unwrap();
        assert_eq!(report.input_electrons(), Some(7.95));
        assert_eq!(report.output_electrons(), Some(8.05));
        assert_eq!(report.neutral_charge(), Some(8.0));
        assert_eq!(report.default_current(), Some(1.25e-5));
        assert_eq!(report.current((2, 3)), Some(-3.0e-6));
        assert_eq!(report.current((1, 3)), None);
        assert_eq!(report.observables()["TotalCurrent(2-3)"], -3.0e-6);
    }

    #[test]
    fn test_malformed_reports() {
        assert!(matches!(
            DetailedOut::parse("nothing to see\n"),
            Err(QueryError::Malformed { line: 0, .. })
        ));
        assert!(matches!(
            DetailedOut::parse("Total energy:   garbage H  oops eV\n"),
            Err(QueryError::Malformed { line: 1, .. })
        ));
    }

    #[test]
    fn test_energy_labels() {
        assert_eq!(Energy::from_label("Etot"), Some(Energy::Total));
        assert_eq!(Energy::from_label("Total energy"), Some(Energy::Total));
        assert_eq!(Energy::from_label("Fermi level:"), Some(Energy::Fermi));
        assert_eq!(Energy::from_label("Energy L.S"), Some(Energy::SpinOrbit));
        assert_eq!(Energy::from_label("Kinetic energy"), None);
    }

    #[test]
    fn test_resolve_extractor() {
        let config = ExtractorConfig::default();
        let extractor = resolve_extractor(&config).unwrap();
        assert_eq!(extractor.kind(), "DetailedOut");
        assert_eq!(extractor.output_file(), Path::new("detailed.out"));

        let unknown = ExtractorConfig {
            kind: "Bands".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            resolve_extractor(&unknown),
            Err(QueryError::UnknownKind { .. })
        ));

        let no_file = ExtractorConfig {
            kind: "KeyValue".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            resolve_extractor(&no_file),
            Err(QueryError::MissingFileSetting { .. })
        ));
    }

    #[test]
    fn test_extract_from_directory() {
        let dir = tempdir().unwrap();
        let extractor = resolve_extractor(&ExtractorConfig::default()).unwrap();
        assert!(matches!(
            extractor.extract(dir.path()),
            Err(QueryError::OutputMissing(_))
        ));

        fs::write(dir.path().join("detailed.out"), SCC_OUT).unwrap();
        let map = extractor.extract(dir.path()).unwrap();
        assert_eq!(map["Ef"], -3.2356);
    }

    #[test]
    fn test_key_value() {
        let map = KeyValueExtractor::parse("# comment\nEgap = 1.12\nmeff: 0.19 # note\nEcb 0.5\n\n")
            .unwrap();
        assert_eq!(map["Egap"], 1.12);
        assert_eq!(map["meff"], 0.19);
        assert_eq!(map["Ecb"], 0.5);

        assert!(matches!(
            KeyValueExtractor::parse("a = b\n"),
            Err(QueryError::Malformed { line: 1, .. })
        ));
    }

    #[test]
    fn test_table() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("bands.dat"),
            "# k  e1  e2\n1 -1.0 2.0\n2 -0.5 1.5\n",
        )
        .unwrap();
        let config = ExtractorConfig {
            kind: "Table".to_string(),
            file: Some(PathBuf::from("bands.dat")),
            columns: vec![
                TableColumn {
                    name: "evb".to_string(),
                    row: 1,
                    column: 1,
                    scale: 1.0,
                },
                TableColumn {
                    name: "ecb_meV".to_string(),
                    row: 0,
                    column: 2,
                    scale: 1000.0,
                },
                TableColumn {
                    name: "beyond".to_string(),
                    row: 9,
                    column: 0,
                    scale: 1.0,
                },
            ],
            ..Default::default()
        };
        let map = resolve_extractor(&config)
            .unwrap()
            .extract(dir.path())
            .unwrap();
        assert_eq!(map["evb"], -0.5);
        assert_eq!(map["ecb_meV"], 2000.0);
        assert!(!map.contains_key("beyond"));
    }
}
