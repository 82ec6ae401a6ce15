// ABOUTME: SQL Server connection plumbing - connect, retry, transaction control
// ABOUTME: Also holds identifier quoting and connection-string redaction for logs

use std::time::Duration;

use tiberius::{Client, Config};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

use crate::error::Result;

/// Maximum number of initial connection attempts before giving up
const MAX_CONNECT_RETRIES: u32 = 5;

/// Maximum delay between connection attempts (in seconds)
const MAX_RETRY_DELAY_SECS: u64 = 60;

pub type MssqlClient = Client<Compat<TcpStream>>;

/// Connect to SQL Server using an ADO.NET-style connection string.
pub async fn connect(connection_string: &str) -> Result<MssqlClient> {
    let config = Config::from_ado_string(connection_string)?;
    let tcp = TcpStream::connect(config.get_addr()).await?;
    tcp.set_nodelay(true)?;
    let client = Client::connect(config, tcp.compat_write()).await?;
    Ok(client)
}

/// Connect with exponential backoff.
///
/// Used for the initial connection where the database may still be coming up;
/// per-transaction connections inside the monitor loops fail fast instead so
/// that transient outages surface as ordinary skipped ticks.
pub async fn connect_with_retry(connection_string: &str) -> Result<MssqlClient> {
    let mut attempt = 0u32;
    loop {
        match connect(connection_string).await {
            Ok(client) => return Ok(client),
            Err(e) if attempt < MAX_CONNECT_RETRIES => {
                let delay_secs = std::cmp::min(2u64.pow(attempt), MAX_RETRY_DELAY_SECS);
                tracing::warn!(
                    "connection attempt {} failed: {}; retrying in {}s",
                    attempt + 1,
                    e,
                    delay_secs
                );
                tokio::time::sleep(Duration::from_secs(delay_secs)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Open a RepeatableRead transaction on the connection.
pub async fn begin_repeatable_read(client: &mut MssqlClient) -> Result<()> {
    client
        .execute(
            "SET TRANSACTION ISOLATION LEVEL REPEATABLE READ; BEGIN TRANSACTION;",
            &[],
        )
        .await?;
    Ok(())
}

pub async fn commit(client: &mut MssqlClient) -> Result<()> {
    client.execute("COMMIT TRANSACTION;", &[]).await?;
    Ok(())
}

pub async fn rollback(client: &mut MssqlClient) -> Result<()> {
    client.execute("ROLLBACK TRANSACTION;", &[]).await?;
    Ok(())
}

/// Bracket-quote a SQL Server identifier.
///
/// Only ever applied to catalog-sourced names; quoting still escapes closing
/// brackets so a hostile column name cannot break out of the identifier.
pub fn quote_ident(name: &str) -> String {
    format!("[{}]", name.replace(']', "]]"))
}

/// Redact credential material from a connection string before logging.
pub fn redact_connection_string(connection_string: &str) -> String {
    connection_string
        .split(';')
        .map(|part| {
            let key = part.split('=').next().unwrap_or("").trim();
            if key.eq_ignore_ascii_case("password") || key.eq_ignore_ascii_case("pwd") {
                format!("{key}=***")
            } else {
                part.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(";")
}
