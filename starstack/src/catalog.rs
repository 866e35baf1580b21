//! Reading, writing and merging source catalogs.
//!
//! A catalog file is plain text with one source per line, `x y flux`,
//! separated by whitespace. Lines starting with `#` are comments. Lines that do
//! not hold three numbers are skipped with a warning; they never abort loading.

use crate::error::Result;
use crate::source::SourcePoint;
use crate::spatial_index::SpatialIndex;
use crate::warper::Warper;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use tracing::{info, info_span, warn};

/// Parses catalog text from `reader`.
///
/// # Errors
/// Only I/O errors of the reader are reported; malformed lines are skipped.
///
/// # Examples
/// ```
/// # use starstack::catalog::parse_catalog;
/// let text = "# x y flux\n10 20 300\nnot a source\n1.5e1 2 7\n";
/// let sources = parse_catalog(text.as_bytes()).unwrap();
/// assert_eq!(sources.len(), 2);
/// assert_eq!(sources[1].x, 15.0);
/// ```
pub fn parse_catalog<R: BufRead>(reader: R) -> Result<Vec<SourcePoint>> {
    let mut sources = Vec::new();
    for (number, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let fields: Vec<f64> = trimmed
            .split_whitespace()
            .take(3)
            .map_while(|field| field.parse().ok())
            .collect();
        match fields[..] {
            [x, y, flux] => sources.push(SourcePoint::new(x, y, flux)),
            _ => warn!(line = number + 1, content = trimmed, "invalid catalog line"),
        }
    }
    Ok(sources)
}

/// Loads a catalog file.
pub fn load_catalog<P: AsRef<Path>>(path: P) -> Result<Vec<SourcePoint>> {
    let path = path.as_ref();
    let sources = parse_catalog(BufReader::new(File::open(path)?))?;
    info!(path = %path.display(), count = sources.len(), "loaded catalog");
    Ok(sources)
}

/// Writes `sources` as catalog text, preceded by a `# x y flux` header.
pub fn write_catalog<W: Write>(mut writer: W, sources: &[SourcePoint]) -> Result<()> {
    writeln!(writer, "# x y flux")?;
    for s in sources {
        writeln!(writer, "{:e} {:e} {:e}", s.x, s.y, s.flux)?;
    }
    writer.flush()?;
    Ok(())
}

/// Saves `sources` to a catalog file.
pub fn save_catalog<P: AsRef<Path>>(path: P, sources: &[SourcePoint]) -> Result<()> {
    write_catalog(BufWriter::new(File::create(path)?), sources)
}

/// Returns up to `count` finite sources ordered by decreasing flux.
///
/// Sources with a non-finite position or flux are skipped.
pub fn brightest(sources: &[SourcePoint], count: usize) -> Vec<SourcePoint> {
    let mut sorted: Vec<SourcePoint> = sources.iter().filter(|s| s.is_finite()).copied().collect();
    sorted.sort_by(|a, b| b.flux.total_cmp(&a.flux));
    sorted.truncate(count);
    sorted
}

/// Merges `source` into `reference` after mapping it through `warper`.
///
/// A mapped source whose nearest reference entry lies within `match_radius`
/// is combined with it: the entry moves to the flux-weighted mean position and
/// takes the summed flux. Unmatched sources are appended at their mapped
/// position. Non-finite sources are dropped.
///
/// # Examples
/// ```
/// # use starstack::catalog::merge_sources;
/// # use starstack::source::SourcePoint;
/// # use starstack::warper::Warper;
/// let reference = vec![SourcePoint::new(0.0, 0.0, 1.0)];
/// let source = vec![SourcePoint::new(1.0, 0.0, 3.0), SourcePoint::new(50.0, 50.0, 2.0)];
/// let merged = merge_sources(&Warper::identity(2).unwrap(), &reference, &source, 2.5).unwrap();
/// assert_eq!(merged.len(), 2);
/// assert_eq!(merged[0], SourcePoint::new(0.75, 0.0, 4.0));
/// ```
pub fn merge_sources(
    warper: &Warper,
    reference: &[SourcePoint],
    source: &[SourcePoint],
    match_radius: f64,
) -> Result<Vec<SourcePoint>> {
    let _span = info_span!("merge", reference = reference.len(), source = source.len()).entered();

    let mut merged = reference.to_vec();
    let indexed: Vec<(usize, [f64; 2])> = reference
        .iter()
        .enumerate()
        .filter(|(_, r)| r.is_finite())
        .map(|(i, r)| (i, r.position()))
        .collect();
    if indexed.is_empty() {
        merged.extend(source.iter().filter(|s| s.is_finite()).map(|s| {
            let [x, y] = warper.apply(s.position());
            SourcePoint::new(x, y, s.flux)
        }));
        return Ok(merged);
    }
    let index = SpatialIndex::build(indexed)?;

    for s in source.iter().filter(|s| s.is_finite()) {
        let w = warper.apply(s.position());
        let (&i, distance) = index.nearest_with_distance(&w);
        if distance <= match_radius {
            let r = merged[i];
            let flux = s.flux + r.flux;
            if flux > 0.0 {
                merged[i] = SourcePoint::new(
                    (s.flux * w[0] + r.flux * r.x) / flux,
                    (s.flux * w[1] + r.flux * r.y) / flux,
                    flux,
                );
            }
        } else {
            merged.push(SourcePoint::new(w[0], w[1], s.flux));
        }
    }

    info!(
        merged = merged.len(),
        new = merged.len() - reference.len(),
        "merged catalogs"
    );
    Ok(merged)
}
