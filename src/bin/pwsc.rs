use std::{env, error::Error, path::PathBuf, process, sync::Arc};

use clap::Parser;
use log::{debug, warn};
use pwsclient::{
    AuthMethod, AuthRequest, Engine, EngineConfig,
    crypto::{from_hex, to_hex},
    protocol::DEFAULT_PORT,
};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Directory node, e.g. /PasswordServer/10.0.0.5
    node: String,
    /// Auth method, e.g. clear-text, get-policy, list-replicas
    method: AuthMethod,
    /// User to authenticate as (`name` or `name,<server id>`)
    #[arg(long, default_value = "")]
    user: String,
    /// Environment variable holding the user's secret
    #[arg(long)]
    secret_env: Option<String>,
    /// Environment variable holding the new secret for password methods
    #[arg(long)]
    new_secret_env: Option<String>,
    /// Account the method acts on
    #[arg(long)]
    target: Option<String>,
    /// Method argument (policy, user data, sync start, key size, ...)
    #[arg(long)]
    value: Option<String>,
    /// Relay challenge, hex
    #[arg(long)]
    challenge: Option<String>,
    /// Relay response, hex
    #[arg(long)]
    response: Option<String>,
    /// Print the result as hex
    #[arg(long)]
    hex: bool,
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,
    /// Replica list file
    #[arg(long)]
    replicas: Option<PathBuf>,
    /// Replica cache file
    #[arg(long)]
    cache: Option<PathBuf>,
    /// Never fall back to 127.0.0.1
    #[arg(long)]
    no_localhost: bool,
}

fn secret_from(var: Option<&str>) -> Result<Vec<u8>, Box<dyn Error>> {
    match var {
        Some(var) => Ok(env::var(var)
            .map_err(|e| format!("cannot read secret from ${var}: {e}"))?
            .into_bytes()),
        None => Ok(Vec::new()),
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let mut config = EngineConfig {
        default_port: cli.port,
        replica_file: cli.replicas.clone(),
        localhost_fallback: !cli.no_localhost,
        ..EngineConfig::default()
    };
    if let Some(cache) = cli.cache.clone() {
        config.cache_path = cache;
    }

    let engine = Engine::install(config);
    let session = Arc::new(engine.open(&cli.node)?);

    let on_interrupt = Arc::clone(&session);
    ctrlc::set_handler(move || {
        if let Err(e) = engine.close(&on_interrupt) {
            warn!("close on interrupt failed: {e}");
        }
        process::exit(130);
    })?;

    let mut req = AuthRequest::new(cli.method, cli.user.clone())
        .secret(&secret_from(cli.secret_env.as_deref())?)
        .new_secret(&secret_from(cli.new_secret_env.as_deref())?);
    if let Some(target) = &cli.target {
        req = req.target(target);
    }
    if let Some(value) = &cli.value {
        req = req.value(value.as_bytes());
    }
    if let Some(challenge) = &cli.challenge {
        req = req.challenge(&from_hex(challenge)?);
    }
    if let Some(response) = &cli.response {
        req = req.response(&from_hex(response)?);
    }

    let result = run(engine, &session, req, cli.method);
    engine.close(&session)?;
    let (status, out) = result?;

    debug!("{} finished: {status:?}", cli.method);
    if out.is_empty() {
        println!("{status:?}");
    } else if cli.hex {
        println!("{}", to_hex(&out));
    } else {
        match String::from_utf8(out) {
            Ok(text) => println!("{text}"),
            Err(e) => println!("{}", to_hex(e.as_bytes())),
        }
    }
    Ok(())
}

/// Performs the method and collects every part of its output.
fn run(
    engine: &Engine,
    session: &pwsclient::Session,
    req: AuthRequest,
    method: AuthMethod,
) -> Result<(pwsclient::AuthStatus, Vec<u8>), Box<dyn Error>> {
    let max_output = req.max_output;
    let mut resp = engine.perform(session, req)?;
    let status = resp.status;
    let mut out = std::mem::take(&mut resp.data);

    while let Some(token) = resp.continuation {
        if method.info().kind == pwsclient::sasl::MethodKind::Interactive {
            // the caller has to answer; a one-shot command cannot
            engine.release_continuation(session, token)?;
            break;
        }
        resp = engine.perform(
            session,
            AuthRequest::new(method, "").max_output(max_output).resume(token),
        )?;
        out.append(&mut resp.data);
    }
    Ok((status, out))
}
