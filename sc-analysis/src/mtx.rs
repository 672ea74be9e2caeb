use anyhow::{bail, format_err, Context, Error};
use flate2::bufread::MultiGzDecoder;
use log::info;
use sc_types::CountMatrix;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Raw data file names, in lookup order
pub const DATA_FILES: [&str; 4] = ["data.mtx", "data.mtx.gz", "data.txt", "data.txt.gz"];

/// First raw data file present in `dir`
pub fn find_data_file(dir: &Path) -> Option<PathBuf> {
    DATA_FILES.iter().map(|f| dir.join(f)).find(|p| p.exists())
}

fn open_maybe_gz(path: &Path) -> Result<Box<dyn BufRead>, Error> {
    let file = BufReader::new(File::open(path).with_context(|| path.display().to_string())?);
    if path.extension().map_or(false, |e| e == "gz") {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(file))))
    } else {
        Ok(Box::new(file))
    }
}

/// Load a genes x cells matrix from MTX or dense text, gzipped or not.
pub fn load_matrix(path: impl AsRef<Path>) -> Result<CountMatrix, Error> {
    let path = path.as_ref();
    let name = path.to_string_lossy();
    let mat = if name.ends_with(".mtx") || name.ends_with(".mtx.gz") {
        load_mtx(path)?
    } else {
        load_dense(path)?
    };
    info!(
        "loaded {} genes x {} cells ({} non-zero) from {}",
        mat.genes(),
        mat.cells(),
        mat.nnz(),
        path.display()
    );
    Ok(mat)
}

/// Load a CountMatrix from (optionally gzipped) MTX format
pub fn load_mtx(path: impl AsRef<Path>) -> Result<CountMatrix, Error> {
    let path = path.as_ref();
    let mut reader = open_maybe_gz(path)?;
    let mut line = String::new();
    let mut shape: Option<(usize, usize)> = None;
    let mut triplets = Vec::new();

    loop {
        line.clear();
        let sz = reader.read_line(&mut line).with_context(|| path.display().to_string())?;
        if sz == 0 {
            break;
        }
        if line.starts_with('%') || line.trim().is_empty() {
            continue;
        }
        let mut data = line.split_whitespace();
        if shape.is_none() {
            let nrow = data.next().ok_or_else(|| format_err!("no NROW"))?.parse::<usize>()?;
            let ncol = data.next().ok_or_else(|| format_err!("no NCOL"))?.parse::<usize>()?;
            let nnz = data.next().ok_or_else(|| format_err!("no NNZ"))?.parse::<usize>()?;
            shape = Some((nrow, ncol));
            triplets.reserve(nnz);
        } else {
            let row = data.next().ok_or_else(|| format_err!("missing ROW"))?.parse::<usize>()?;
            let col = data.next().ok_or_else(|| format_err!("missing COL"))?.parse::<usize>()?;
            let val = data.next().map_or(Ok(1.0), str::parse::<f64>)?;
            if row == 0 || col == 0 {
                bail!("MTX indices are 1-based, found ({}, {})", row, col);
            }
            triplets.push((row - 1, col - 1, val));
        }
    }

    let Some((genes, cells)) = shape else { bail!("no matrix found in {}", path.display()) };
    CountMatrix::from_triplets(genes, cells, triplets)
}

/// Load whitespace-separated dense text, one row per gene.
pub fn load_dense(path: impl AsRef<Path>) -> Result<CountMatrix, Error> {
    let path = path.as_ref();
    let reader = open_maybe_gz(path)?;
    let mut triplets = Vec::new();
    let mut cells = None;
    let mut genes = 0;
    for line in reader.lines() {
        let line = line.with_context(|| path.display().to_string())?;
        if line.trim().is_empty() {
            continue;
        }
        let mut n = 0;
        for (c, tok) in line.split_whitespace().enumerate() {
            let v = tok
                .parse::<f64>()
                .with_context(|| format!("row {} of {}", genes + 1, path.display()))?;
            if v != 0.0 {
                triplets.push((genes, c, v));
            }
            n += 1;
        }
        match cells {
            None => cells = Some(n),
            Some(expected) if expected != n => {
                bail!("row {} has {} columns, expected {}", genes + 1, n, expected)
            }
            _ => {}
        }
        genes += 1;
    }
    CountMatrix::from_triplets(genes, cells.unwrap_or(0), triplets)
}

/// Write a matrix in MTX coordinate format.
pub fn write_mtx(mat: &CountMatrix, w: &mut dyn Write) -> Result<(), Error> {
    let mut w = BufWriter::new(w);
    writeln!(w, "%%MatrixMarket matrix coordinate real general")?;
    writeln!(w, "{} {} {}", mat.genes(), mat.cells(), mat.nnz())?;
    for c in 0..mat.cells() {
        for (g, v) in mat.cell(c) {
            writeln!(w, "{} {} {}", g + 1, c + 1, v)?;
        }
    }
    w.flush()?;
    Ok(())
}

/// One gene name per line. Missing file yields `None`.
pub fn load_gene_names(path: impl AsRef<Path>) -> Result<Option<Vec<String>>, Error> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(None);
    }
    let reader = open_maybe_gz(path)?;
    let mut names = Vec::new();
    for line in reader.lines() {
        let line = line.with_context(|| path.display().to_string())?;
        let name = line.trim();
        if !name.is_empty() {
            names.push(name.to_string());
        }
    }
    Ok(Some(names))
}

#[cfg(test)]
mod test {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use ndarray::array;

    #[test]
    fn test_mtx_roundtrip_gz() {
        let dir = tempfile::tempdir().unwrap();
        let mat = CountMatrix::from_dense(&array![[1.0, 0.0], [0.0, 2.5], [3.0, 0.0]]);
        let mut buf = Vec::new();
        write_mtx(&mat, &mut buf).unwrap();

        let path = dir.path().join("data.mtx.gz");
        let mut enc = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        enc.write_all(&buf).unwrap();
        enc.finish().unwrap();

        assert_eq!(find_data_file(dir.path()), Some(path.clone()));
        assert_eq!(load_matrix(&path).unwrap(), mat);
    }

    #[test]
    fn test_dense_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.txt");
        std::fs::write(&path, "1 0 2\n0 0 4\n").unwrap();
        let mat = load_matrix(&path).unwrap();
        assert_eq!(mat.to_dense(), array![[1.0, 0.0, 2.0], [0.0, 0.0, 4.0]]);

        std::fs::write(&path, "1 0 2\n0 4\n").unwrap();
        assert!(load_matrix(&path).is_err());
    }

    #[test]
    fn test_gene_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gene_names.txt");
        assert_eq!(load_gene_names(&path).unwrap(), None);
        std::fs::write(&path, "CD3D\nMS4A1\n\n").unwrap();
        assert_eq!(load_gene_names(&path).unwrap().unwrap(), vec!["CD3D", "MS4A1"]);
    }
}
