//! Minimal reader for 1-D FITS spectra.
//!
//! Supports the common linear-dispersion layout: a primary HDU whose first
//! axis is flux, with the wavelength solution in CRVAL1/CRPIX1/CDELT1 (or
//! CD1_1). 2-D images contribute their first row. Payloads are big-endian
//! per the standard; BSCALE/BZERO are applied, and a "nm" unit hint converts
//! wavelengths to Å.

use super::IoError;
use crate::types::RawSpectrum;
use std::collections::HashMap;
use std::path::Path;

/// FITS blocks are fixed 2880-byte records of 80-byte header cards.
const BLOCK: usize = 2880;
const CARD: usize = 80;

/// Read a 1-D spectrum from a FITS file.
pub fn read_fits_spectrum(path: &Path) -> Result<RawSpectrum, IoError> {
    let bytes = std::fs::read(path).map_err(|e| IoError::Unreadable {
        path: path.display().to_string(),
        source: e,
    })?;
    let invalid = |msg: &str| IoError::InvalidInput(format!("{}: {msg}", path.display()));

    if bytes.len() < BLOCK {
        return Err(invalid("shorter than one FITS block"));
    }

    // Parse header cards until END; the data unit starts at the next block
    // boundary.
    let mut header: HashMap<String, String> = HashMap::new();
    let mut data_offset = None;
    'blocks: for block_start in (0..bytes.len()).step_by(BLOCK) {
        if block_start + BLOCK > bytes.len() {
            break;
        }
        for card_start in (block_start..block_start + BLOCK).step_by(CARD) {
            let card = &bytes[card_start..card_start + CARD];
            let text = String::from_utf8_lossy(card);
            let keyword = text[..8.min(text.len())].trim().to_string();
            if keyword == "END" {
                data_offset = Some(block_start + BLOCK);
                break 'blocks;
            }
            if let Some(eq) = text.find('=') {
                let value = text[eq + 1..]
                    .split('/')
                    .next()
                    .unwrap_or("")
                    .trim()
                    .trim_matches('\'')
                    .trim()
                    .to_string();
                header.insert(keyword, value);
            }
        }
    }
    let data_offset = data_offset.ok_or_else(|| invalid("no END card in header"))?;

    if header.get("SIMPLE").map(String::as_str) != Some("T") {
        return Err(invalid("not a simple FITS file"));
    }
    let bitpix: i64 = keyword_num(&header, "BITPIX").ok_or_else(|| invalid("missing BITPIX"))?
        as i64;
    let naxis = keyword_num(&header, "NAXIS").unwrap_or(0.0) as usize;
    if naxis == 0 {
        return Err(invalid("no data axes"));
    }
    let naxis1 = keyword_num(&header, "NAXIS1").ok_or_else(|| invalid("missing NAXIS1"))? as usize;
    if naxis1 == 0 {
        return Err(invalid("empty first axis"));
    }

    let crval1 = keyword_num(&header, "CRVAL1").unwrap_or(0.0);
    let crpix1 = keyword_num(&header, "CRPIX1").unwrap_or(1.0);
    let cdelt1 = keyword_num(&header, "CDELT1")
        .or_else(|| keyword_num(&header, "CD1_1"))
        .unwrap_or(1.0);
    let bscale = keyword_num(&header, "BSCALE").unwrap_or(1.0);
    let bzero = keyword_num(&header, "BZERO").unwrap_or(0.0);
    if cdelt1 <= 0.0 {
        return Err(invalid("non-positive dispersion CDELT1"));
    }

    // Unit hint: nanometers convert to Å.
    let unit = header
        .get("CUNIT1")
        .or_else(|| header.get("BUNIT"))
        .map(|u| u.to_ascii_lowercase())
        .unwrap_or_default();
    let wave_scale = if unit.contains("nm") { 10.0 } else { 1.0 };

    // First NAXIS1 samples (the first row of a 2-D image).
    let width = (bitpix.unsigned_abs() / 8) as usize;
    let needed = naxis1 * width;
    if data_offset + needed > bytes.len() {
        return Err(invalid("data unit truncated"));
    }
    let payload = &bytes[data_offset..data_offset + needed];

    let mut wave = Vec::with_capacity(naxis1);
    let mut flux = Vec::with_capacity(naxis1);
    for i in 0..naxis1 {
        let chunk = &payload[i * width..(i + 1) * width];
        let raw = match bitpix {
            8 => chunk[0] as f64,
            16 => i16::from_be_bytes([chunk[0], chunk[1]]) as f64,
            32 => i32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as f64,
            -32 => f32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as f64,
            -64 => f64::from_be_bytes([
                chunk[0], chunk[1], chunk[2], chunk[3], chunk[4], chunk[5], chunk[6], chunk[7],
            ]),
            other => return Err(invalid(&format!("unsupported BITPIX {other}"))),
        };
        let value = bscale * raw + bzero;
        let w = (crval1 + (i as f64 + 1.0 - crpix1) * cdelt1) * wave_scale;
        if value.is_finite() && w.is_finite() {
            wave.push(w);
            flux.push(value);
        }
    }
    Ok(RawSpectrum { wave, flux })
}

fn keyword_num(header: &HashMap<String, String>, key: &str) -> Option<f64> {
    header.get(key)?.parse::<f64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    /// Build a minimal FITS file with a BITPIX=-32 1-D spectrum.
    fn write_fits(
        dir: &Path,
        name: &str,
        flux: &[f32],
        crval1: f64,
        cdelt1: f64,
        extra_cards: &[String],
    ) -> std::path::PathBuf {
        let mut header = String::new();
        let mut push_card = |text: &str| {
            header.push_str(&format!("{text:<80}"));
        };
        push_card("SIMPLE  =                    T");
        push_card("BITPIX  =                  -32");
        push_card("NAXIS   =                    1");
        push_card(&format!("NAXIS1  = {:>20}", flux.len()));
        push_card(&format!("CRVAL1  = {crval1:>20}"));
        push_card("CRPIX1  =                    1");
        push_card(&format!("CDELT1  = {cdelt1:>20}"));
        for card in extra_cards {
            push_card(card);
        }
        push_card("END");
        while header.len() % BLOCK != 0 {
            header.push(' ');
        }

        let mut data: Vec<u8> = Vec::new();
        for &f in flux {
            data.extend_from_slice(&f.to_be_bytes());
        }
        while data.len() % BLOCK != 0 {
            data.push(0);
        }

        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(header.as_bytes()).unwrap();
        file.write_all(&data).unwrap();
        path
    }

    #[test]
    fn test_read_f32_spectrum() {
        let dir = tempfile::tempdir().unwrap();
        let flux: Vec<f32> = (0..100).map(|i| 1.0 + i as f32 * 0.01).collect();
        let path = write_fits(dir.path(), "spec.fits", &flux, 4000.0, 2.0, &[]);

        let s = read_fits_spectrum(&path).unwrap();
        assert_eq!(s.len(), 100);
        assert_eq!(s.wave[0], 4000.0);
        assert_eq!(s.wave[1], 4002.0);
        assert!((s.flux[10] - 1.1).abs() < 1e-6);
    }

    #[test]
    fn test_nm_unit_converted() {
        let dir = tempfile::tempdir().unwrap();
        let flux = vec![1.0f32; 50];
        let path = write_fits(
            dir.path(),
            "nm.fits",
            &flux,
            400.0,
            0.2,
            &["CUNIT1  = 'nm      '".to_string()],
        );
        let s = read_fits_spectrum(&path).unwrap();
        assert_eq!(s.wave[0], 4000.0);
        assert!((s.wave[1] - 4002.0).abs() < 1e-9);
    }

    #[test]
    fn test_truncated_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.fits");
        std::fs::write(&path, b"SIMPLE = T").unwrap();
        assert!(matches!(
            read_fits_spectrum(&path),
            Err(IoError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_non_fits_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("noise.fits");
        std::fs::write(&path, vec![0u8; BLOCK * 2]).unwrap();
        assert!(read_fits_spectrum(&path).is_err());
    }
}
