//! PostgreSQL driver and connection pool

use crate::config::{PostgresConfig, TlsConfig};
use crate::migrate::migrate;
use crate::tx::PgTx;
use native_tls::{Certificate, Identity, TlsConnector};
use parking_lot::Mutex;
use postgres::config::SslMode;
use postgres_native_tls::MakeTlsConnector;
use r2d2::Pool;
use r2d2_postgres::PostgresConnectionManager;
use relkv_core::{BackendError, Clock, Config, Connection, Context, Driver, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Engine name reported by [`PostgresDriver`]
pub const BACKEND_NAME: &str = "postgres";

/// Wait for a pooled connection when the context carries no deadline
const DEFAULT_CHECKOUT_TIMEOUT: Duration = Duration::from_secs(30);

type Manager = PostgresConnectionManager<MakeTlsConnector>;

/// Driver for one PostgreSQL database
#[derive(Debug, Clone)]
pub struct PostgresDriver {
    cfg: PostgresConfig,
}

impl PostgresDriver {
    /// Create a driver from a validated configuration
    pub fn new(cfg: PostgresConfig) -> Self {
        Self { cfg }
    }

    /// Adapter-specific configuration
    pub fn postgres_config(&self) -> &PostgresConfig {
        &self.cfg
    }

    fn client_config(&self, connect_timeout: Duration) -> postgres::Config {
        let mut pg = postgres::Config::new();
        pg.host(&self.cfg.host)
            .port(self.cfg.port)
            .dbname(&self.cfg.database)
            .user(&self.cfg.user)
            .application_name("relkv")
            .ssl_mode(SslMode::Require)
            .connect_timeout(connect_timeout);
        pg
    }
}

fn checkout_timeout(ctx: &Context) -> Duration {
    ctx.remaining()
        .unwrap_or(DEFAULT_CHECKOUT_TIMEOUT)
        .max(Duration::from_millis(1))
}

fn read_pem(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| {
        BackendError::bad_parameter(format!("failed to read '{}': {}", path.display(), e))
    })
}

/// Build a connector that trusts only the configured CA, verifies the
/// server host name and presents the client identity.
pub fn tls_connector(tls: &TlsConfig) -> Result<MakeTlsConnector> {
    let ca = Certificate::from_pem(&read_pem(&tls.ca_file)?).map_err(|e| {
        BackendError::bad_parameter(format!("invalid CA '{}': {}", tls.ca_file.display(), e))
    })?;
    let identity = Identity::from_pkcs8(
        &read_pem(&tls.client_cert_file)?,
        &read_pem(&tls.client_key_file)?,
    )
    .map_err(|e| BackendError::bad_parameter(format!("invalid client identity: {e}")))?;
    let connector = TlsConnector::builder()
        .add_root_certificate(ca)
        .identity(identity)
        .build()
        .map_err(|e| BackendError::bad_parameter(format!("invalid TLS configuration: {e}")))?;
    Ok(MakeTlsConnector::new(connector))
}

impl Driver for PostgresDriver {
    type Conn = PostgresDb;

    fn backend_name(&self) -> &'static str {
        BACKEND_NAME
    }

    fn config(&self) -> &Config {
        &self.cfg.backend
    }

    fn open(&self, ctx: &Context) -> Result<PostgresDb> {
        ctx.check()?;
        let tls = tls_connector(&self.cfg.tls)?;
        let manager = Manager::new(self.client_config(checkout_timeout(ctx)), tls);

        let pool_cfg = &self.cfg.backend.pool;
        let pool = Pool::builder()
            .max_size(pool_cfg.max_open_conns)
            .min_idle(Some(pool_cfg.max_idle_conns))
            .idle_timeout(pool_cfg.idle_timeout())
            .max_lifetime(pool_cfg.conn_max_lifetime)
            .connection_timeout(checkout_timeout(ctx))
            .build(manager)
            .map_err(|e| {
                BackendError::connection(format!("failed to connect to {}: {}", self.cfg.addr(), e))
            })?;

        let mut client = pool
            .get_timeout(checkout_timeout(ctx))
            .map_err(|e| BackendError::connection(e.to_string()))?;
        let version = migrate(&mut client, self.cfg.backend.clock.now())?;
        info!(
            addr = %self.cfg.addr(),
            database = %self.cfg.database,
            schema_version = version,
            "opened postgres database"
        );

        drop(client);
        Ok(PostgresDb {
            pool: Mutex::new(Some(pool)),
            clock: Arc::clone(&self.cfg.backend.clock),
        })
    }
}

/// Pooled connection to a PostgreSQL database
///
/// Closing drops the pool: idle sessions disconnect at once, sessions held
/// by open transactions when those transactions end.
pub struct PostgresDb {
    pool: Mutex<Option<Pool<Manager>>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for PostgresDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pool = self.pool.lock();
        f.debug_struct("PostgresDb")
            .field("state", &pool.as_ref().map(|p| p.state()))
            .field("closed", &pool.is_none())
            .finish_non_exhaustive()
    }
}

impl PostgresDb {
    fn begin_tx(&self, ctx: &Context, read_only: bool) -> PgTx {
        let clock = Arc::clone(&self.clock);
        let Some(pool) = self.pool.lock().clone() else {
            return PgTx::failed(
                BackendError::connection("database is closed"),
                ctx,
                clock,
                read_only,
            );
        };
        if let Err(err) = ctx.check() {
            return PgTx::failed(err, ctx, clock, read_only);
        }
        match pool.get_timeout(checkout_timeout(ctx)) {
            Ok(client) => PgTx::start(client, ctx, clock, read_only),
            Err(e) => PgTx::failed(
                BackendError::connection(e.to_string()),
                ctx,
                clock,
                read_only,
            ),
        }
    }
}

impl Connection for PostgresDb {
    type Tx = PgTx;

    fn begin(&self, ctx: &Context) -> PgTx {
        self.begin_tx(ctx, false)
    }

    fn read_only(&self, ctx: &Context) -> PgTx {
        self.begin_tx(ctx, true)
    }

    fn close(&self) -> Result<()> {
        if let Some(pool) = self.pool.lock().take() {
            drop(pool);
            info!("closed postgres database");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn missing_tls(dir: &Path) -> TlsConfig {
        TlsConfig {
            client_cert_file: dir.join("client.crt"),
            client_key_file: dir.join("client.key"),
            ca_file: dir.join("ca.crt"),
        }
    }

    #[test]
    fn test_missing_tls_files_fail_open() {
        let dir = tempfile::tempdir().unwrap();
        let driver = PostgresDriver::new(
            PostgresConfig::new("127.0.0.1:1", missing_tls(dir.path())).unwrap(),
        );
        let err = driver.open(&Context::background()).unwrap_err();
        assert!(matches!(err, BackendError::BadParameter(_)), "{err}");
    }

    #[test]
    fn test_garbage_ca_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let tls = missing_tls(dir.path());
        std::fs::write(&tls.ca_file, b"not a certificate").unwrap();
        let err = tls_connector(&tls).err().expect("expected tls_connector to fail");
        assert!(matches!(err, BackendError::BadParameter(_)), "{err}");
    }

    #[test]
    fn test_client_config() {
        let cfg = PostgresConfig::new("db.internal:6432", missing_tls(&PathBuf::from("/x")))
            .unwrap()
            .with_user("svc");
        let pg = PostgresDriver::new(cfg).client_config(Duration::from_secs(3));
        assert_eq!(pg.get_ports(), &[6432]);
        assert_eq!(pg.get_user(), Some("svc"));
        assert_eq!(pg.get_dbname(), Some("relkv"));
        assert_eq!(pg.get_ssl_mode(), SslMode::Require);
        assert_eq!(pg.get_connect_timeout(), Some(&Duration::from_secs(3)));
    }

    #[test]
    fn test_canceled_context_fails_open() {
        let driver = PostgresDriver::new(
            PostgresConfig::new("127.0.0.1:1", missing_tls(&PathBuf::from("/x"))).unwrap(),
        );
        let ctx = Context::background();
        ctx.cancel();
        assert_eq!(driver.open(&ctx).unwrap_err(), BackendError::Canceled);
    }
}
