use std::io::Read;
use std::process::ExitCode;

use hostnic_plugin::config::{CniEnv, NetConf};
use hostnic_plugin::{CNI_VERSION, Error, Result, add::add, delete::delete, version::version};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn main() -> ExitCode {
    let _guard = setup_logging();
    let env = match CniEnv::from_env() {
        Ok(env) => env,
        Err(e) => return e.into_response(CNI_VERSION).write_out(),
    };
    info!("invoked with command {}", env.command);

    let resp = match env.command.as_str() {
        "ADD" => match read_config() {
            Ok(conf) => add(&env, &conf),
            Err(e) => e.into_response(CNI_VERSION),
        },
        "DEL" => match read_config() {
            Ok(conf) => delete(&env, &conf),
            Err(e) => e.into_response(CNI_VERSION),
        },
        "VERSION" => version(),
        other => Error::InvalidEnv(format!("unsupported CNI_COMMAND {other}"))
            .into_response(CNI_VERSION),
    };

    resp.write_out()
}

fn read_config() -> Result<NetConf> {
    let mut buf = String::new();
    std::io::stdin().read_to_string(&mut buf)?;
    let conf: NetConf = serde_json::from_str(&buf)?;
    if conf.r#type != "hostnic" {
        return Err(Error::InvalidConfig(format!(
            "unexpected plugin type {}",
            conf.r#type
        )));
    }
    Ok(conf)
}

fn setup_logging() -> WorkerGuard {
    // stdout belongs to the CNI result, so logs go to a rolling file
    let file_appender = tracing_appender::rolling::daily("/var/log/hostnic", "plugin.log");
    let (nonblocking, guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hostnic_plugin=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(nonblocking))
        .init();
    guard
}
