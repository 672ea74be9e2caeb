//! On-disk formats of artifacts.
//!
//! Numeric artifacts are plain text so that other tools can read them: one value per
//! line for flat arrays, whitespace-separated rows for matrices. Structured artifacts
//! are JSON.

use anyhow::{bail, format_err, Context, Error};
use ndarray::Array2;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::Path;

/// A value that can be stored as an artifact file.
pub trait Codec: Sized {
    fn read(path: &Path) -> Result<Self, Error>;
    fn write(&self, w: &mut dyn Write) -> Result<(), Error>;
}

fn read_lines(path: &Path) -> Result<Vec<String>, Error> {
    let text = fs::read_to_string(path).with_context(|| path.display().to_string())?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

fn parse_index(tok: &str) -> Result<usize, Error> {
    if let Ok(v) = tok.parse::<usize>() {
        return Ok(v);
    }
    let f = tok.parse::<f64>().with_context(|| format!("bad index {tok:?}"))?;
    if f < 0.0 || f.fract() != 0.0 {
        bail!("bad index {:?}", tok);
    }
    Ok(f as usize)
}

fn parse_flag(tok: &str) -> Result<bool, Error> {
    match tok {
        "1" | "True" | "true" => Ok(true),
        "0" | "False" | "false" => Ok(false),
        _ => tok
            .parse::<f64>()
            .map(|f| f != 0.0)
            .map_err(|_| format_err!("bad boolean {:?}", tok)),
    }
}

impl Codec for Vec<usize> {
    fn read(path: &Path) -> Result<Self, Error> {
        read_lines(path)?.iter().map(|l| parse_index(l)).collect()
    }

    fn write(&self, w: &mut dyn Write) -> Result<(), Error> {
        for v in self {
            writeln!(w, "{v}")?;
        }
        Ok(())
    }
}

impl Codec for Vec<bool> {
    fn read(path: &Path) -> Result<Self, Error> {
        read_lines(path)?.iter().map(|l| parse_flag(l)).collect()
    }

    fn write(&self, w: &mut dyn Write) -> Result<(), Error> {
        for &v in self {
            writeln!(w, "{}", u8::from(v))?;
        }
        Ok(())
    }
}

impl Codec for Vec<f64> {
    fn read(path: &Path) -> Result<Self, Error> {
        read_lines(path)?
            .iter()
            .map(|l| l.parse::<f64>().with_context(|| format!("bad number {l:?}")))
            .collect()
    }

    fn write(&self, w: &mut dyn Write) -> Result<(), Error> {
        for v in self {
            writeln!(w, "{v:.18e}")?;
        }
        Ok(())
    }
}

impl Codec for Array2<f64> {
    fn read(path: &Path) -> Result<Self, Error> {
        let lines = read_lines(path)?;
        let mut cols = None;
        let mut flat = Vec::new();
        for (i, line) in lines.iter().enumerate() {
            let before = flat.len();
            for tok in line.split_whitespace() {
                flat.push(
                    tok.parse::<f64>()
                        .with_context(|| format!("row {} of {}", i + 1, path.display()))?,
                );
            }
            let n = flat.len() - before;
            if *cols.get_or_insert(n) != n {
                bail!("ragged matrix in {}", path.display());
            }
        }
        Ok(Array2::from_shape_vec((lines.len(), cols.unwrap_or(0)), flat)?)
    }

    fn write(&self, w: &mut dyn Write) -> Result<(), Error> {
        for row in self.rows() {
            let mut first = true;
            for v in row {
                if !first {
                    write!(w, " ")?;
                }
                write!(w, "{v:.18e}")?;
                first = false;
            }
            writeln!(w)?;
        }
        Ok(())
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, Error> {
    let text = fs::read_to_string(path).with_context(|| path.display().to_string())?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn write_json<T: Serialize>(value: &T, w: &mut dyn Write) -> Result<(), Error> {
    serde_json::to_writer(w, value)?;
    Ok(())
}

macro_rules! json_codec {
    ($($t:ty),* $(,)?) => {
        $(
            impl Codec for $t {
                fn read(path: &Path) -> Result<Self, Error> {
                    read_json(path)
                }

                fn write(&self, w: &mut dyn Write) -> Result<(), Error> {
                    write_json(self, w)
                }
            }
        )*
    };
}

json_codec!(
    diff_exp::RankedGenes,
    diff_exp::PairwiseTable,
    sc_types::ColorTrack,
    crate::diffexp::TrackDiffexp,
);

#[cfg(test)]
mod test {
    use super::*;
    use ndarray::array;

    fn roundtrip<T: Codec>(value: &T, dir: &Path) -> T {
        let path = dir.join("x.txt");
        let mut buf = Vec::new();
        value.write(&mut buf).unwrap();
        fs::write(&path, buf).unwrap();
        T::read(&path).unwrap()
    }

    #[test]
    fn test_text_formats() {
        let dir = tempfile::tempdir().unwrap();
        let m = array![[1.5, -2.0], [1e-300, 3.0]];
        assert_eq!(roundtrip(&m, dir.path()), m);
        let f = vec![0.1, 1.0 / 3.0];
        assert_eq!(roundtrip(&f, dir.path()), f);
        let mask = vec![true, false, true];
        assert_eq!(roundtrip(&mask, dir.path()), mask);
    }

    #[test]
    fn test_foreign_spellings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cells_subset.txt");
        fs::write(&path, "True\nFalse\n1.000000000000000000e+00\n").unwrap();
        assert_eq!(Vec::<bool>::read(&path).unwrap(), vec![true, false, true]);

        fs::write(&path, "3\n4.000000000000000000e+00\n").unwrap();
        assert_eq!(Vec::<usize>::read(&path).unwrap(), vec![3, 4]);
        fs::write(&path, "2.5\n").unwrap();
        assert!(Vec::<usize>::read(&path).is_err());

        fs::write(&path, "1 2\n3\n").unwrap();
        assert!(Array2::<f64>::read(&path).is_err());
    }
}
