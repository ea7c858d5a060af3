//! Bank persistence.

use super::{parse_timestamp, SqliteStore};
use crate::models::{Bank, Disposition};
use crate::{Error, Result};
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

fn row_to_bank(row: &Row<'_>) -> rusqlite::Result<(Bank, String)> {
    let created_at: String = row.get(7)?;
    Ok((
        Bank {
            bank_id: row.get(0)?,
            name: row.get(1)?,
            mission: row.get(2)?,
            disposition: Disposition {
                skepticism: row.get(3)?,
                literalism: row.get(4)?,
                empathy: row.get(5)?,
                bias_strength: row.get(6)?,
            },
            created_at: Utc::now(),
        },
        created_at,
    ))
}

const BANK_COLUMNS: &str =
    "bank_id, name, mission, skepticism, literalism, empathy, bias_strength, created_at";

impl SqliteStore {
    /// Fetches a bank profile.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_bank(&self, bank_id: &str) -> Result<Option<Bank>> {
        let conn = self.lock();
        let raw = conn
            .query_row(
                &format!("SELECT {BANK_COLUMNS} FROM banks WHERE bank_id = ?1"),
                params![bank_id],
                row_to_bank,
            )
            .optional()?;
        match raw {
            None => Ok(None),
            Some((mut bank, created_at)) => {
                bank.created_at = parse_timestamp(&created_at)?;
                Ok(Some(bank))
            },
        }
    }

    /// Fetches a bank profile, creating a default one if missing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for an empty bank id, or a storage
    /// error.
    pub fn ensure_bank(&self, bank_id: &str) -> Result<Bank> {
        if bank_id.is_empty() {
            return Err(Error::InvalidInput("empty bank_id".to_string()));
        }
        if let Some(bank) = self.get_bank(bank_id)? {
            return Ok(bank);
        }
        let bank = Bank::new(bank_id);
        self.upsert_bank(&bank)?;
        Ok(bank)
    }

    /// Inserts or updates a bank profile.
    ///
    /// # Errors
    ///
    /// Returns an error if the statement fails.
    pub fn upsert_bank(&self, bank: &Bank) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO banks
                 (bank_id, name, mission, skepticism, literalism, empathy,
                  bias_strength, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(bank_id) DO UPDATE SET
                 name = excluded.name,
                 mission = excluded.mission,
                 skepticism = excluded.skepticism,
                 literalism = excluded.literalism,
                 empathy = excluded.empathy,
                 bias_strength = excluded.bias_strength",
            params![
                bank.bank_id,
                bank.name,
                bank.mission,
                bank.disposition.skepticism,
                bank.disposition.literalism,
                bank.disposition.empathy,
                bank.disposition.bias_strength,
                bank.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Sets the bank mission, creating the bank if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the statement fails.
    pub fn set_bank_mission(&self, bank_id: &str, mission: &str) -> Result<()> {
        self.ensure_bank(bank_id)?;
        let conn = self.lock();
        conn.execute(
            "UPDATE banks SET mission = ?2 WHERE bank_id = ?1",
            params![bank_id, mission],
        )?;
        Ok(())
    }

    /// Deletes a bank and everything scoped to it. Returns whether a bank
    /// row existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the statement fails.
    pub fn delete_bank(&self, bank_id: &str) -> Result<bool> {
        let conn = self.lock();
        let deleted = conn.execute("DELETE FROM banks WHERE bank_id = ?1", params![bank_id])?;
        Ok(deleted > 0)
    }

    /// Lists all bank profiles.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn list_banks(&self) -> Result<Vec<Bank>> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare(&format!("SELECT {BANK_COLUMNS} FROM banks ORDER BY bank_id"))?;
        let rows = stmt.query_map([], row_to_bank)?;
        let mut banks = Vec::new();
        for row in rows {
            let (mut bank, created_at) = row?;
            bank.created_at = parse_timestamp(&created_at)?;
            banks.push(bank);
        }
        Ok(banks)
    }
}
