// 💾 Panel Store - canonical panel + diagnostics persistence
//
// Only called after a run has fully succeeded. The CSV written is the exact
// byte string the digest was computed over. The SQLite copy is written in a
// single transaction so a failed write never leaves a half-built panel.

use crate::config::OutputConfig;
use crate::error::Result;
use crate::pipeline::PipelineOutput;
use chrono::Utc;
use rusqlite::{params, Connection};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

// ============================================================================
// FILES
// ============================================================================

/// Write every configured output for a finished run
pub fn write_outputs(output: &OutputConfig, run: &PipelineOutput) -> Result<()> {
    write_file(&output.panel_csv, &run.panel_csv)?;
    write_file(&output.diagnostics_json, &serde_json::to_vec_pretty(&run.report)?)?;

    if let Some(db_path) = &output.sqlite {
        let mut conn = Connection::open(db_path)?;
        setup_database(&conn)?;
        save_run(&mut conn, run)?;
    }

    tracing::info!(
        panel = %output.panel_csv.display(),
        diagnostics = %output.diagnostics_json.display(),
        sqlite = output.sqlite.is_some(),
        "outputs written"
    );
    Ok(())
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    // Write next to the target, then rename over it
    let staging = path.with_extension("partial");
    fs::write(&staging, bytes)?;
    fs::rename(&staging, path)?;
    Ok(())
}

// ============================================================================
// SQLITE
// ============================================================================

pub fn setup_database(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS runs (
            run_id TEXT PRIMARY KEY,
            panel_digest TEXT NOT NULL,
            panel_rows INTEGER NOT NULL,
            retention_rate REAL NOT NULL,
            report TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS panel (
            run_id TEXT NOT NULL,
            region_id TEXT NOT NULL,
            year INTEGER NOT NULL,
            real_value REAL NOT NULL,
            population REAL NOT NULL,
            quality_flag INTEGER NOT NULL,
            is_interpolated INTEGER NOT NULL,
            reform_year INTEGER,
            reform_type TEXT,
            flags TEXT NOT NULL,
            PRIMARY KEY (run_id, region_id, year)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS diagnostics (
            run_id TEXT NOT NULL,
            stage TEXT NOT NULL,
            reason TEXT NOT NULL,
            count INTEGER NOT NULL,
            PRIMARY KEY (run_id, stage, reason)
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_panel_region ON panel(region_id, year)",
        [],
    )?;

    Ok(())
}

/// Replace any previous copy of the same run, all or nothing
pub fn save_run(conn: &mut Connection, run: &PipelineOutput) -> Result<usize> {
    let report = &run.report;
    let tx = conn.transaction()?;

    tx.execute("DELETE FROM panel WHERE run_id = ?1", params![report.run_id])?;
    tx.execute("DELETE FROM diagnostics WHERE run_id = ?1", params![report.run_id])?;
    tx.execute("DELETE FROM runs WHERE run_id = ?1", params![report.run_id])?;

    tx.execute(
        "INSERT INTO runs (run_id, panel_digest, panel_rows, retention_rate, report, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            report.run_id,
            report.panel_digest,
            report.panel_rows as i64,
            report.crosswalk.retention_rate,
            serde_json::to_string(report)?,
            Utc::now().to_rfc3339(),
        ],
    )?;

    let mut inserted = 0;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO panel (
                run_id, region_id, year, real_value, population,
                quality_flag, is_interpolated, reform_year, reform_type, flags
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )?;
        for row in &run.panel.rows {
            let flags: BTreeMap<&str, bool> = run
                .panel
                .flag_names
                .iter()
                .map(String::as_str)
                .zip(row.flags.iter().copied())
                .collect();
            stmt.execute(params![
                report.run_id,
                row.region_id,
                row.year,
                row.real_value,
                row.population,
                row.quality_flag,
                row.is_interpolated,
                row.reform_year,
                row.reform_type,
                serde_json::to_string(&flags)?,
            ])?;
            inserted += 1;
        }

        let mut stmt = tx.prepare(
            "INSERT INTO diagnostics (run_id, stage, reason, count) VALUES (?1, ?2, ?3, ?4)",
        )?;
        for diag in report.diagnostic_rows() {
            stmt.execute(params![report.run_id, diag.stage, diag.reason, diag.count as i64])?;
        }
    }

    tx.commit()?;
    Ok(inserted)
}

pub fn panel_row_count(conn: &Connection, run_id: &str) -> Result<i64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM panel WHERE run_id = ?1",
        params![run_id],
        |row| row.get(0),
    )?;
    Ok(count)
}

// ============================================================================
// TESTS
// ============================================================================
