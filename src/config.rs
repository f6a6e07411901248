//! Opciones de configuracion del cliente, del pool y de cada conexion.

use std::time::Duration;

use rand::Rng;

use crate::Error;

/// Credenciales para el handshake (`AUTH [username] password`).
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: String,
}

impl Credentials {
    pub fn password(password: impl Into<String>) -> Credentials {
        Credentials {
            username: None,
            password: password.into(),
        }
    }

    pub fn user(username: impl Into<String>, password: impl Into<String>) -> Credentials {
        Credentials {
            username: Some(username.into()),
            password: password.into(),
        }
    }
}

// La contraseña nunca debe aparecer en los logs.
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Politica de reconexion: backoff exponencial acotado.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Numero maximo de intentos de conexion consecutivos.
    pub max_attempts: u32,
    /// Espera tras el primer intento fallido.
    pub base_delay: Duration,
    /// Techo de la espera entre intentos.
    pub max_delay: Duration,
    /// Reparte las esperas aleatoriamente entre la mitad y el total.
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            jitter: true,
        }
    }
}

impl ReconnectPolicy {
    /// Espera antes del intento `attempt + 1`, siendo `attempt` el numero
    /// de intentos fallidos (empezando en 1).
    pub fn delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        let delay = self
            .base_delay
            .checked_mul(1u32 << shift)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        if self.jitter && !delay.is_zero() {
            let factor = rand::thread_rng().gen_range(0.5..=1.0);
            delay.mul_f64(factor)
        } else {
            delay
        }
    }
}

/// Configuracion completa del cliente.
#[derive(Clone, Debug)]
pub struct Config {
    /// Numero de conexiones de comandos. Con `1` se usa una unica
    /// conexion dedicada.
    pub pool_size: usize,
    pub auth: Option<Credentials>,
    /// Base de datos seleccionada tras autenticar (`SELECT n`).
    pub database: Option<u32>,
    pub reconnect: ReconnectPolicy,
    /// Tiempo maximo que un llamador espera cada respuesta.
    pub command_timeout: Option<Duration>,
    /// Tiempo maximo para abrir el transporte.
    pub connect_timeout: Option<Duration>,
    /// Una conexion sin trabajo pendiente durante este tiempo se cierra; el
    /// pool la vuelve a abrir cuando se necesite.
    pub idle_timeout: Option<Duration>,
    /// Mensajes pendientes de entregar por suscriptor antes de descartar.
    pub subscriber_backlog_limit: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            pool_size: 1,
            auth: None,
            database: None,
            reconnect: ReconnectPolicy::default(),
            command_timeout: None,
            connect_timeout: Some(Duration::from_secs(5)),
            idle_timeout: None,
            subscriber_backlog_limit: 1024,
        }
    }
}

impl Config {
    pub fn with_pool_size(mut self, pool_size: usize) -> Config {
        self.pool_size = pool_size;
        self
    }

    pub fn with_auth(mut self, auth: Credentials) -> Config {
        self.auth = Some(auth);
        self
    }

    pub fn with_database(mut self, database: u32) -> Config {
        self.database = Some(database);
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Config {
        self.reconnect = reconnect;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Config {
        self.command_timeout = Some(timeout);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Config {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Config {
        self.idle_timeout = Some(timeout);
        self
    }

    pub fn with_subscriber_backlog_limit(mut self, limit: usize) -> Config {
        self.subscriber_backlog_limit = limit;
        self
    }

    /// Comprueba que la configuracion sea utilizable.
    pub fn validate(&self) -> crate::Result<()> {
        if self.pool_size == 0 {
            return Err(Error::Config("pool_size must be at least 1".into()));
        }
        if self.reconnect.max_attempts == 0 {
            return Err(Error::Config("reconnect.max_attempts must be at least 1".into()));
        }
        if self.reconnect.base_delay > self.reconnect.max_delay {
            return Err(Error::Config("reconnect.base_delay exceeds reconnect.max_delay".into()));
        }
        if self.subscriber_backlog_limit == 0 {
            return Err(Error::Config("subscriber_backlog_limit must be at least 1".into()));
        }
        Ok(())
    }
}
