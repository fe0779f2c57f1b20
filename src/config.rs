use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub secret_key: String,
}

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();

    let secret_key = std::env::var("TOKENPOOL_SECRET_KEY")
        .unwrap_or_else(|_| "CHANGE_ME_DEV_ONLY_SECRET".into());

    if secret_key == "CHANGE_ME_DEV_ONLY_SECRET" {
        eprintln!("warning: TOKENPOOL_SECRET_KEY is not set — using insecure placeholder.");
    }

    Ok(Config {
        host: std::env::var("TOKENPOOL_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
        port: std::env::var("TOKENPOOL_PORT")
            .unwrap_or_else(|_| "4000".into())
            .parse()
            .unwrap_or(4000),
        database_url: std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/tokenpool".into()),
        secret_key,
    })
}
