#[macro_use]
extern crate lazy_static;
use actix_identity::IdentityMiddleware;
use actix_session::{storage::CookieSessionStore, SessionMiddleware};

use std::str::FromStr;
use tera::Tera;

use actix_files::{Files, NamedFile};
use actix_web::{
    http::{Method, StatusCode},
    middleware,
    web::{self, Data},
    App, Either, HttpResponse, HttpServer, Responder,
};
use log::info;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode},
    SqlitePool,
};
mod bootstrap;
mod config;
mod db;
mod errors;
mod guards;
mod permissions;
mod routes;
mod session;
mod structs;
mod utils;
use config::Config;
use errors::AppError;
use permissions::PermissionCache;

#[derive(Debug, Clone)]
pub struct AppState {
    db_pool: SqlitePool,
    config: Config,
    permissions: PermissionCache,
}

lazy_static! {
    pub static ref TEMPLATES: Tera = {
        let mut tera = match Tera::new("templates/**/*") {
            Ok(t) => t,
            Err(e) => {
                log::error!("Parsing error(s): {}", e);
                ::std::process::exit(1);
            }
        };
        tera.autoescape_on(vec![".html"]);
        tera
    };
}

async fn connect(database_url: &str) -> Result<SqlitePool, AppError> {
    let opts = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .read_only(false)
        .busy_timeout(std::time::Duration::from_secs(5));

    let db_pool = SqlitePool::connect_with(opts).await?;
    sqlx::migrate!().run(&db_pool).await?;
    Ok(db_pool)
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenvy::dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = Config::from_env()?;
    let db_pool = connect(&config.database_url).await?;
    info!("Database migrated successfully");

    let state = AppState {
        db_pool,
        config: config.clone(),
        permissions: PermissionCache::default(),
    };
    state.permissions.get(&state.db_pool).await;

    info!(
        "Starting HTTP server on http://{}:{}/",
        config.bind_addr, config.port
    );

    let bind = (config.bind_addr.clone(), config.port);
    HttpServer::new(move || {
        App::new()
            // enable automatic response compression - usually register this first
            .wrap(middleware::Compress::default())
            .wrap(IdentityMiddleware::default())
            .wrap(
                SessionMiddleware::builder(CookieSessionStore::default(), state.config.session_key())
                    .cookie_secure(state.config.cookie_secure)
                    .build(),
            )
            // enable logger - always register Actix Web Logger middleware last
            .wrap(middleware::Logger::default())
            .service(Files::new("/static", "static"))
            .configure(routes::configure)
            .app_data(Data::new(state.clone()))
            .default_service(web::to(default_handler))
    })
    .bind(bind)?
    .run()
    .await
}

async fn default_handler(req_method: Method) -> Result<impl Responder, std::io::Error> {
    match req_method {
        Method::GET => {
            let file = NamedFile::open("static/404.html")?
                .customize()
                .with_status(StatusCode::NOT_FOUND);
            Ok(Either::Left(file))
        }
        _ => Ok(Either::Right(HttpResponse::MethodNotAllowed().finish())),
    }
}

#[cfg(test)]
mod test_support {
    use std::time::Duration;

    use sqlx::sqlite::SqlitePoolOptions;

    use super::*;
    use crate::bootstrap::GuardTimers;

    /// One connection, so every query sees the same in-memory database.
    pub async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite");
        sqlx::migrate!().run(&pool).await.expect("migrations");
        pool
    }

    pub fn test_config() -> Config {
        Config {
            database_url: "sqlite::memory:".into(),
            bind_addr: "127.0.0.1".into(),
            port: 0,
            session_key: vec![7u8; 64],
            cookie_secure: false,
            timers: GuardTimers {
                tenant_refresh_wait: Duration::from_millis(20),
                loading_ceiling: Duration::from_secs(5),
            },
        }
    }

    pub async fn test_state() -> AppState {
        AppState {
            db_pool: test_pool().await,
            config: test_config(),
            permissions: PermissionCache::default(),
        }
    }
}
