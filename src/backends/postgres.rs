//! Pooled, TLS-secured connection management for the Postgres-backed
//! catalog store.
//!
//! Mirrors the connection setup in `review-database`'s
//! `src/backends/postgres.rs`: `rustls` for TLS, `diesel-async` over a
//! `bb8` pool for query execution, and `diesel_migrations` embedded
//! migrations so the schema travels with the binary.

use std::{fs::read, path::Path, sync::Arc};

use diesel_async::{
    pooled_connection::{bb8, AsyncDieselConnectionManager, ManagerConfig},
    AsyncPgConnection,
};
use diesel_migrations::{embed_migrations, EmbeddedMigrations};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use rustls::{ClientConfig, RootCertStore};
use rustls_pki_types::CertificateDer;

use crate::Error;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("./migrations");

pub(crate) type Pool = bb8::Pool<AsyncPgConnection>;

#[derive(Clone)]
pub(crate) struct ConnectionPool {
    pool: Pool,
}

impl ConnectionPool {
    /// Builds a pool, trusting the platform's native root certificates
    /// plus any additional CA certificates supplied in `extra_root_ca`.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS configuration or the initial
    /// connection to Postgres fails.
    pub(crate) async fn new<P: AsRef<Path>>(
        database_url: &str,
        extra_root_ca: &[P],
        max_size: u32,
        min_idle: u32,
    ) -> Result<Self, Error> {
        let tls_config = build_tls_config(extra_root_ca)?;
        let mut config = ManagerConfig::default();
        config.custom_setup = Box::new(move |url| establish(url, tls_config.clone()));
        let manager =
            AsyncDieselConnectionManager::<AsyncPgConnection>::new_with_config(database_url, config);
        let pool = bb8::Pool::builder()
            .max_size(max_size)
            .min_idle(Some(min_idle))
            .build(manager)
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;
        Ok(Self { pool })
    }

    pub(crate) async fn get(
        &self,
    ) -> Result<bb8::PooledConnection<'_, AsyncPgConnection>, Error> {
        self.pool
            .get()
            .await
            .map_err(|e| Error::Connection(e.to_string()))
    }
}

fn build_tls_config<P: AsRef<Path>>(extra_root_ca: &[P]) -> Result<Arc<ClientConfig>, Error> {
    let mut roots = RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs().certs {
        roots
            .add(cert)
            .map_err(|e| Error::Tls(e.to_string()))?;
    }
    for path in extra_root_ca {
        let pem = read(path).map_err(|e| Error::Tls(e.to_string()))?;
        for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
            let cert: CertificateDer = cert.map_err(|e| Error::Tls(e.to_string()))?;
            roots.add(cert).map_err(|e| Error::Tls(e.to_string()))?;
        }
    }
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

fn establish(
    database_url: &str,
    tls_config: Arc<ClientConfig>,
) -> BoxFuture<'_, diesel::ConnectionResult<AsyncPgConnection>> {
    let fut = async move {
        let connector = tokio_postgres_rustls::MakeRustlsConnect::new((*tls_config).clone());
        let (client, conn) = tokio_postgres::connect(database_url, connector)
            .await
            .map_err(|e| diesel::ConnectionError::BadConnection(e.to_string()))?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::error!("postgres connection closed with error: {e}");
            }
        });
        AsyncPgConnection::try_from(client).await
    };
    fut.boxed()
}
