//! Checksum and transfer manifests for the products of one run.

use std::io;
use std::path::{Path, PathBuf};

use crate::db::checksum::{file_md5, md5sum_line};

/// Write `md5sum` lines for every product into `out`.
pub fn write_md5sum_table(products: &[PathBuf], out: &Path) -> io::Result<()> {
    let mut table = String::new();
    for product in products {
        table.push_str(&md5sum_line(&file_md5(product)?, product));
    }
    std::fs::write(out, table)
}

/// Write `{koaid}.xfr.table`: one product path per line, relative to the
/// night's output directory.
pub fn write_xfr_table(output_dir: &Path, products: &[PathBuf], out: &Path) -> io::Result<()> {
    let mut table = String::new();
    for product in products {
        let relative = product.strip_prefix(output_dir).unwrap_or(product);
        table.push_str(&relative.to_string_lossy());
        table.push('\n');
    }
    std::fs::write(out, table)
}

/// Size in MB (10^6 bytes).
pub fn size_mb(path: &Path) -> io::Result<f64> {
    Ok(std::fs::metadata(path)?.len() as f64 / 1e6)
}

pub fn total_size_mb(paths: &[PathBuf]) -> io::Result<f64> {
    paths.iter().map(|p| size_mb(p)).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::checksum::calculate_checksum;

    #[test]
    fn test_manifests() {
        let dir = tempfile::tempdir().unwrap();
        let lev0 = dir.path().join("lev0");
        std::fs::create_dir_all(&lev0).unwrap();
        let fits = lev0.join("HI.20210304.12345.67.fits");
        let table = lev0.join("HI.20210304.12345.67.metadata.table");
        std::fs::write(&fits, b"abc").unwrap();
        std::fs::write(&table, b"x").unwrap();
        let products = vec![fits.clone(), table.clone()];

        let md5 = lev0.join("HI.20210304.12345.67.md5sum");
        write_md5sum_table(&products, &md5).unwrap();
        let text = std::fs::read_to_string(&md5).unwrap();
        assert_eq!(
            text.lines().next().unwrap(),
            format!("{}  HI.20210304.12345.67.fits", calculate_checksum(b"abc"))
        );

        let xfr = lev0.join("HI.20210304.12345.67.xfr.table");
        write_xfr_table(dir.path(), &products, &xfr).unwrap();
        assert_eq!(
            std::fs::read_to_string(&xfr).unwrap(),
            "lev0/HI.20210304.12345.67.fits\nlev0/HI.20210304.12345.67.metadata.table\n"
        );

        assert!((total_size_mb(&products).unwrap() - 4e-6).abs() < 1e-12);
    }
}
