use anyhow::Result;
use clap::Parser;
use common::{
    config::{ConnectionArgs, ConnectionConfig, Credentials, Principal},
    db::initialize_schema,
    schema::DEFAULT_PRINCIPAL,
};
use log::info;

/// Creates the upload database's application user, collections and indexes.
/// Safe to run again against an initialized database.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[command(flatten)]
    connection: ConnectionArgs,

    /// Application user to create in the target database
    #[arg(long, env = "FILEUPLOADER_APP_USER", default_value = DEFAULT_PRINCIPAL)]
    app_user: String,

    #[arg(long, env = "FILEUPLOADER_APP_PASSWORD", hide_env_values = true)]
    app_password: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let config = ConnectionConfig::from(args.connection);
    let principal = Principal::new(
        config.database.clone(),
        Credentials::new(args.app_user, args.app_password),
    );

    info!("initializing {}", config.target());
    let report = initialize_schema(&config, &principal).await?;
    for (object, provision) in &report.steps {
        info!("{object}: {provision}");
    }
    println!("database {} initialized successfully", config.database);
    Ok(())
}
