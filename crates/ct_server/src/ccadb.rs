// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! Fetching and parsing the CCADB-maintained list of root certificates.
//!
//! The CSV carries quoted PEM blobs with embedded newlines and a variable
//! number of fields per row, so parsing is deliberately permissive: rows are
//! only required to reach the columns the log needs, and unparsable
//! certificates are skipped with a warning rather than failing the fetch.

use anyhow::{anyhow, bail, Context};
use x509_cert::{der::DecodePem, Certificate};

const COL_SUBJECT: &str = "Subject";
const COL_OWNER: &str = "CA Owner";
const COL_PEM: &str = "X.509 Certificate (PEM)";
const COL_SHA256: &str = "SHA-256 Fingerprint";
const COL_USE_CASES: &str = "Intended Use Case(s) Served";

const USE_CASE_SERVER_AUTH: &str = "server authentication (tls) 1.3.6.1.5.5.7.3.1";

/// Fetches the CCADB CSV from `url` and returns the roots whose intended
/// use cases include TLS server authentication.
///
/// # Errors
///
/// Returns an error if the fetch fails, the CSV misses a required column,
/// or no certificate at all can be parsed.
pub async fn fetch_roots(client: &reqwest::Client, url: &str) -> anyhow::Result<Vec<Certificate>> {
    let response = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("fetching roots from {url}"))?;
    if !response.status().is_success() {
        bail!("fetching roots from {url}: status {}", response.status());
    }
    let body = response.bytes().await?;
    parse_roots(&body)
}

/// Parses a CCADB-format CSV, returning the TLS server authentication
/// roots.
///
/// # Errors
///
/// See [`fetch_roots`].
pub fn parse_roots(csv_bytes: &[u8]) -> anyhow::Result<Vec<Certificate>> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(csv_bytes);

    let headers = reader.headers().context("reading CCADB CSV header")?;
    let column = |name: &str| -> anyhow::Result<usize> {
        headers
            .iter()
            .position(|h| h.trim() == name)
            .ok_or_else(|| anyhow!("CCADB CSV header missing column {name:?}"))
    };
    // All of the well-known columns must be declared, even though only the
    // PEM and use-case columns are consumed.
    for required in [COL_SUBJECT, COL_OWNER, COL_SHA256] {
        column(required)?;
    }
    let pem_idx = column(COL_PEM)?;
    let uses_idx = column(COL_USE_CASES)?;

    let mut certificates = Vec::new();
    for row in reader.records() {
        let row = row.context("reading CCADB CSV row")?;
        let Some(pem) = row.get(pem_idx) else {
            continue;
        };
        // There is an "Example CA" row with an empty PEM column.
        if pem.is_empty() {
            continue;
        }
        let Some(uses) = row.get(uses_idx) else {
            continue;
        };
        if !uses.to_lowercase().contains(USE_CASE_SERVER_AUTH) {
            continue;
        }

        // One root has trailing spaces after each PEM line, which breaks
        // strict PEM parsing.
        match Certificate::from_pem(pem.replace(" \n", "\n").as_bytes()) {
            Ok(cert) => certificates.push(cert),
            Err(e) => log::warn!("failed to parse CCADB certificate: {e}"),
        }
    }
    if certificates.is_empty() {
        bail!("no certificates found in CCADB CSV");
    }
    Ok(certificates)
}
