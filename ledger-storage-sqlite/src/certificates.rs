//! Certificate rows and their address relations

use crate::models::{
    AddressId, CertificateKind, CertificateRole, CertificateRow, NewCertificate, TransactionId,
};
use crate::schema::{placeholders, ScopedTx, Table, PARAM_CHUNK};
use crate::Result;
use rusqlite::{params, params_from_iter};
use std::collections::HashMap;

/// Certificate operations inside a scoped transaction
pub struct CertificateStore<'a> {
    tx: &'a ScopedTx<'a>,
}

impl<'a> CertificateStore<'a> {
    /// Tables touched
    pub const TABLES: &'static [Table] = &[Table::Certificate, Table::CertificateAddress];

    /// Bind to `tx`
    pub fn new(tx: &'a ScopedTx<'a>) -> Result<Self> {
        tx.ensure(Self::TABLES)?;
        Ok(Self { tx })
    }

    /// Store a certificate of `transaction_id` with its relations
    pub fn insert(&self, transaction_id: TransactionId, cert: &NewCertificate) -> Result<i64> {
        self.tx.require_write()?;
        self.tx.execute(
            "INSERT INTO certificates (transaction_id, ordinal, kind, payload) VALUES (?1, ?2, ?3, ?4)",
            params![
                transaction_id,
                cert.ordinal,
                cert.kind.code(),
                serde_json::to_string(&cert.payload)?
            ],
        )?;
        let id = self.tx.last_insert_rowid();

        let mut stmt = self.tx.prepare(
            "INSERT INTO certificate_addresses (certificate_id, address_id, relation) VALUES (?1, ?2, ?3)",
        )?;
        for (address_id, role) in &cert.relations {
            stmt.execute(params![id, address_id, role.code()])?;
        }
        Ok(id)
    }

    /// Certificates of `transaction_ids`, ordered by transaction then ordinal
    pub fn of_transactions(&self, transaction_ids: &[TransactionId]) -> Result<Vec<CertificateRow>> {
        let mut out = Vec::new();
        for chunk in transaction_ids.chunks(PARAM_CHUNK) {
            let sql = format!(
                r#"
                SELECT id, transaction_id, ordinal, kind, payload FROM certificates
                WHERE transaction_id IN ({}) ORDER BY transaction_id, ordinal
                "#,
                placeholders(chunk.len())
            );
            let mut stmt = self.tx.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, TransactionId>(1)?,
                    row.get::<_, u32>(2)?,
                    row.get::<_, i32>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?;
            for row in rows {
                let (id, transaction_id, ordinal, kind, payload) = row?;
                out.push(CertificateRow {
                    id,
                    transaction_id,
                    certificate: NewCertificate {
                        ordinal,
                        kind: CertificateKind::from_code(kind)?,
                        payload: serde_json::from_str(&payload)?,
                        relations: Vec::new(),
                    },
                });
            }
        }

        let ids: Vec<i64> = out.iter().map(|c| c.id).collect();
        let mut relations = self.relations(&ids)?;
        for cert in &mut out {
            cert.certificate.relations = relations.remove(&cert.id).unwrap_or_default();
        }
        Ok(out)
    }

    fn relations(&self, certificate_ids: &[i64]) -> Result<HashMap<i64, Vec<(AddressId, CertificateRole)>>> {
        let mut out: HashMap<i64, Vec<(AddressId, CertificateRole)>> = HashMap::new();
        for chunk in certificate_ids.chunks(PARAM_CHUNK) {
            let sql = format!(
                r#"
                SELECT certificate_id, address_id, relation FROM certificate_addresses
                WHERE certificate_id IN ({}) ORDER BY id
                "#,
                placeholders(chunk.len())
            );
            let mut stmt = self.tx.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, AddressId>(1)?,
                    row.get::<_, i32>(2)?,
                ))
            })?;
            for row in rows {
                let (cert_id, address_id, relation) = row?;
                out.entry(cert_id)
                    .or_default()
                    .push((address_id, CertificateRole::from_code(relation)?));
            }
        }
        Ok(out)
    }
}
