//! Session-management CLI and HTTP server entry point (§4.7, §4.9). Mirrors
//! the teacher's `tty-fwd`-style flag surface, extended with the auth/HQ
//! configuration SPEC_FULL.md adds.

use std::path::PathBuf;

use anyhow::{anyhow, Context};
use argument_parser::Parser;
use tracing_subscriber::EnvFilter;
use vibetunnel_core::config::{AuthConfig, Config, HqConfig, RemoteOfConfig};
use vibetunnel_core::sessions::SessionManager;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> anyhow::Result<()> {
    init_tracing();

    let mut parser = Parser::from_env();

    let mut control_path = Config::default_control_dir();
    let mut session_id = None::<String>;
    let mut send_key = None::<String>;
    let mut send_text = None::<String>;
    let mut signal = None::<i32>;
    let mut stop = false;
    let mut kill = false;
    let mut cleanup = false;
    let mut list_sessions = false;
    let mut serve_address = None::<String>;
    let mut static_path = None::<PathBuf>;

    let mut no_auth = false;
    let mut bearer_token = None::<String>;
    let mut jwt_secret = None::<String>;
    let mut hq_bearer_token = None::<String>;
    let mut remote_of_hq_url = None::<String>;
    let mut remote_of_hq_token = None::<String>;
    let mut remote_of_name = None::<String>;
    let mut remote_of_url = None::<String>;

    while let Some(param) = parser.param()? {
        match param {
            p if p.is_long("control-path") => {
                let value: String = parser.value()?;
                control_path = PathBuf::from(value);
            }
            p if p.is_long("list-sessions") => {
                list_sessions = true;
            }
            p if p.is_long("session") => {
                session_id = Some(parser.value()?);
            }
            p if p.is_long("send-key") => {
                send_key = Some(parser.value()?);
            }
            p if p.is_long("send-text") => {
                send_text = Some(parser.value()?);
            }
            p if p.is_long("signal") => {
                let signal_str: String = parser.value()?;
                signal = Some(
                    signal_str
                        .parse()
                        .map_err(|_| anyhow!("invalid signal number: {signal_str}"))?,
                );
            }
            p if p.is_long("stop") => stop = true,
            p if p.is_long("kill") => kill = true,
            p if p.is_long("cleanup") => cleanup = true,
            p if p.is_long("serve") => {
                let addr: String = parser.value()?;
                serve_address = Some(if addr.contains(':') {
                    addr
                } else {
                    format!("127.0.0.1:{addr}")
                });
            }
            p if p.is_long("static-path") => {
                let value: String = parser.value()?;
                static_path = Some(PathBuf::from(value));
            }
            p if p.is_long("no-auth") => no_auth = true,
            p if p.is_long("bearer-token") => bearer_token = Some(parser.value()?),
            p if p.is_long("jwt-secret") => jwt_secret = Some(parser.value()?),
            p if p.is_long("hq") => hq_bearer_token = Some(parser.value()?),
            p if p.is_long("remote-of-hq-url") => remote_of_hq_url = Some(parser.value()?),
            p if p.is_long("remote-of-hq-token") => remote_of_hq_token = Some(parser.value()?),
            p if p.is_long("remote-of-name") => remote_of_name = Some(parser.value()?),
            p if p.is_long("remote-of-url") => remote_of_url = Some(parser.value()?),
            p if p.is_long("help") => {
                print_help();
                return Ok(());
            }
            _ => return Err(parser.unexpected().into()),
        }
    }

    let manager = SessionManager::new(control_path.clone());

    if list_sessions {
        let sessions = manager.list()?;
        println!("{}", serde_json::to_string(&sessions)?);
        return Ok(());
    }

    if let Some(key) = send_key {
        let sid = session_id.as_deref().ok_or_else(|| anyhow!("--send-key requires --session <id>"))?;
        manager.send_key(sid, &key)?;
        return Ok(());
    }

    if let Some(text) = send_text {
        let sid = session_id.as_deref().ok_or_else(|| anyhow!("--send-text requires --session <id>"))?;
        manager.send_input(sid, &text)?;
        return Ok(());
    }

    if let Some(sig) = signal {
        let sid = session_id.as_deref().ok_or_else(|| anyhow!("--signal requires --session <id>"))?;
        send_raw_signal(&manager, sid, sig)?;
        return Ok(());
    }

    if stop {
        let sid = session_id.as_deref().ok_or_else(|| anyhow!("--stop requires --session <id>"))?;
        manager.kill(sid)?;
        return Ok(());
    }

    if kill {
        let sid = session_id.as_deref().ok_or_else(|| anyhow!("--kill requires --session <id>"))?;
        send_raw_signal(&manager, sid, 9)?;
        return Ok(());
    }

    if cleanup {
        return match session_id {
            Some(sid) => manager.cleanup(&sid).map_err(anyhow::Error::from),
            None => manager.cleanup_exited().map(|_| ()).map_err(anyhow::Error::from),
        };
    }

    if let Some(addr) = serve_address {
        let mut config = Config::new(addr);
        config.control_dir = control_path;
        config.static_path = static_path;
        config.auth = resolve_auth_config(no_auth, bearer_token, jwt_secret);
        config.hq = resolve_hq_config(
            hq_bearer_token,
            remote_of_hq_url,
            remote_of_hq_token,
            remote_of_name,
            remote_of_url,
        )?;
        return vibetunnel_core::api::start_server(config).map_err(anyhow::Error::from);
    }

    print_help();
    Ok(())
}

fn send_raw_signal(manager: &SessionManager, session_id: &str, signal_number: i32) -> anyhow::Result<()> {
    if signal_number == 15 {
        return manager.kill(session_id).map_err(anyhow::Error::from);
    }
    let info = manager.get(session_id)?;
    let pid = info.pid.context("session has no pid")?;
    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(pid as i32),
        nix::sys::signal::Signal::try_from(signal_number).map_err(|_| anyhow!("invalid signal number: {signal_number}"))?,
    )
    .map_err(|e| anyhow!("failed to signal session: {e}"))
}

fn resolve_auth_config(no_auth: bool, bearer_token: Option<String>, jwt_secret: Option<String>) -> AuthConfig {
    let mut config = Config::auth_from_env();
    config.no_auth = no_auth;
    config.bearer_token = bearer_token;
    config.jwt_secret = jwt_secret;
    config
}

fn resolve_hq_config(
    hq_bearer_token: Option<String>,
    remote_of_hq_url: Option<String>,
    remote_of_hq_token: Option<String>,
    remote_of_name: Option<String>,
    remote_of_url: Option<String>,
) -> anyhow::Result<HqConfig> {
    let remote_of = match (remote_of_hq_url, remote_of_hq_token, remote_of_name, remote_of_url) {
        (None, None, None, None) => None,
        (Some(hq_url), Some(hq_bearer_token), Some(my_name), Some(my_url)) => Some(RemoteOfConfig {
            hq_url,
            hq_bearer_token,
            my_name,
            my_url,
        }),
        _ => {
            return Err(anyhow!(
                "--remote-of-hq-url, --remote-of-hq-token, --remote-of-name and --remote-of-url must all be set together"
            ))
        }
    };

    if let (Some(hq_token), Some(remote)) = (&hq_bearer_token, &remote_of) {
        if hq_token == &remote.hq_bearer_token {
            return Err(anyhow!(
                "--hq and --remote-of-hq-token must not use the same bearer token on one process"
            ));
        }
    }

    Ok(HqConfig {
        hq_bearer_token,
        remote_of,
    })
}

fn print_help() {
    println!("Usage: vibetunnel [options]");
    println!("Options:");
    println!("  --control-path <path>        Where the control directory is located");
    println!("  --list-sessions              List all sessions as JSON");
    println!("  --session <id>               Operate on this session");
    println!("  --send-key <key>             Send a symbolic key to --session");
    println!("  --send-text <text>           Send literal text to --session");
    println!("  --signal <number>            Send a raw signal number to --session's pid");
    println!("  --stop                       SIGTERM --session");
    println!("  --kill                       SIGKILL --session");
    println!("  --cleanup                    Remove exited sessions (all, or just --session)");
    println!("  --serve <addr>                Start the HTTP server (host:port or just port)");
    println!("  --static-path <path>         Serve a static web frontend bundle from this path");
    println!("  --no-auth                    Disable the auth gate entirely");
    println!("  --bearer-token <token>       Configure a static bearer token");
    println!("  --jwt-secret <secret>        Validate bearer tokens as HS256 JWTs");
    println!("  --hq <token>                 Act as an HQ; remotes present this bearer token");
    println!("  --remote-of-hq-url <url>     Register as a remote of this HQ at startup");
    println!("  --remote-of-hq-token <token> Bearer token to present to that HQ");
    println!("  --remote-of-name <name>      This node's name as seen by the HQ");
    println!("  --remote-of-url <url>        This node's URL as seen by the HQ");
    println!("  --help                       Show this help message");
}
