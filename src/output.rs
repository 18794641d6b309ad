use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Local;
use ndarray::Array2;
use serde_json::json;

use crate::result::Results;
use crate::settings::Settings;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::AttenuationEstimate;
    use nalgebra::Point3;

    fn results() -> Results {
        let mut results = Results::new_empty(
            vec![1.0, 2.0],
            vec![Point3::new(0.0, 0.0, 1.0), Point3::new(0.0, 1.0, 0.0)],
            vec![],
            vec![1],
        );
        results.set_spectrum(0, 0, &[AttenuationEstimate { value: 0.5, error: 0.01 }; 2]);
        results.set_spectrum(0, 1, &[AttenuationEstimate { value: 0.25, error: 0.02 }; 2]);
        results.finish(false);
        results
    }

    #[test]
    fn table_has_one_line_per_cell() {
        let dir = std::env::temp_dir().join(format!("muscat_output_{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let results = results();
        write_table(&results.wavelengths, &results.attenuation, &results.errors, &dir.join("table")).unwrap();
        let text = fs::read_to_string(dir.join("table")).unwrap();
        let rows: Vec<&str> = text.lines().filter(|l| !l.starts_with('#')).collect();
        assert_eq!(rows.len(), 4);
        let fields: Vec<f64> = rows[2].split_whitespace().map(|f| f.parse().unwrap()).collect();
        assert_eq!(fields, vec![1.0, 1.0, 0.25, 0.02]);
        fs::remove_dir_all(&dir).unwrap();
    }
}

/// Writes every output file of a run into the configured directory.
pub fn writeup(results: &Results, settings: &Settings) -> Result<()> {
    let dir = &settings.directory;
    fs::create_dir_all(dir).with_context(|| format!("could not create output directory {:?}", dir))?;

    write_table(&results.wavelengths, &results.attenuation, &results.errors, &dir.join("attenuation"))?;
    if results.orders.len() > 1 {
        for order in &results.orders {
            write_table(
                &results.wavelengths,
                &order.attenuation,
                &order.errors,
                &dir.join(format!("attenuation_order_{}", order.order)),
            )?;
        }
    }
    write_quadrature(results, &dir.join("quadrature"))?;
    write_summary(results, settings, &dir.join("results.json"))?;
    write_settings(settings, &dir.join("settings.toml"))?;
    Ok(())
}

/// Whitespace separated `spectrum wavelength value error`, one line per cell.
pub fn write_table(wavelengths: &[f64], values: &Array2<f64>, errors: &Array2<f64>, path: &Path) -> Result<()> {
    let file = File::create(path).with_context(|| format!("could not create {:?}", path))?;
    let mut writer = BufWriter::new(file);

    writeln!(writer, "# spectrum wavelength value error")?;
    for (spectrum, (row, error_row)) in values.outer_iter().zip(errors.outer_iter()).enumerate() {
        for ((wavelength, value), error) in wavelengths.iter().zip(row.iter()).zip(error_row.iter()) {
            writeln!(writer, "{} {} {} {}", spectrum, wavelength, value, error)?;
        }
    }
    writer.flush()?;
    Ok(())
}

fn write_quadrature(results: &Results, path: &Path) -> Result<()> {
    let Some(quadrature) = &results.quadrature else {
        return Ok(());
    };
    let file = File::create(path).with_context(|| format!("could not create {:?}", path))?;
    let mut writer = BufWriter::new(file);

    writeln!(writer, "# spectrum wavelength a1 a2")?;
    for ((spectrum, k), a1) in quadrature.a1.indexed_iter() {
        let a2 = quadrature.a2.as_ref().map(|a2| a2[[spectrum, k]]);
        match a2 {
            Some(a2) => writeln!(writer, "{} {} {} {}", spectrum, results.wavelengths[k], a1, a2)?,
            None => writeln!(writer, "{} {} {}", spectrum, results.wavelengths[k], a1)?,
        }
    }
    writer.flush()?;
    Ok(())
}

fn write_summary(results: &Results, settings: &Settings, path: &Path) -> Result<()> {
    let summary = json!({
        "timestamp": Local::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
        "method": settings.method.to_string(),
        "emode": settings.emode.to_string(),
        "seed": results.seed,
        "spectra": results.num_spectra(),
        "masked": results.masked,
        "wavelengths": results.wavelengths,
        "orders": results.orders.iter().map(|o| o.order).collect::<Vec<_>>(),
        "summed": settings.sum_orders,
        "statistics": results.stats,
        "drop_fraction": results.stats.drop_fraction(),
    });
    let file = File::create(path).with_context(|| format!("could not create {:?}", path))?;
    serde_json::to_writer_pretty(BufWriter::new(file), &summary)?;
    Ok(())
}

fn write_settings(settings: &Settings, path: &Path) -> Result<()> {
    let text = toml::to_string_pretty(settings).context("could not serialise the settings")?;
    fs::write(path, text).with_context(|| format!("could not write {:?}", path))?;
    Ok(())
}
