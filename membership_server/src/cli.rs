use std::{env, env::VarError};

const README: &str = "\
Membership payment gateway server

The server takes no command line arguments. It is configured entirely through environment variables (a .env file in
the working directory is also read). Unset or invalid values fall back to their defaults, with a warning in the log.

Logging is controlled with RUST_LOG, e.g. RUST_LOG=info,access_log=info,membership_engine=debug

Secrets (MPG_JWT_SECRET, MPG_REDIS_URL, MPG_AMQP_URL, MPG_ALIPAY_PRIVATE_KEY, MPG_WECHAT_API_KEY) are never printed.";

/// There's no real CLI for the server. Any argument prints the help and the current configuration.
pub fn handle_command_line_args() -> bool {
    let has_cli_args = env::args().count() > 1;
    if has_cli_args {
        println!("\n{README}\n");
        display_envs();
    }
    has_cli_args
}

fn display_envs() {
    // Be explicit about which envars to print, so as to avoid accidentally exposing secrets
    const DISPLAY_ENVS: [&str; 18] = [
        "RUST_LOG",
        "MPG_HOST",
        "MPG_PORT",
        "MPG_DATABASE_URL",
        "MPG_AMQP_RETRY_ATTEMPTS",
        "MPG_AMQP_RETRY_DELAY_MS",
        "MPG_UNPAID_ORDER_TIMEOUT_HOURS",
        "MPG_EXPIRY_PAGE_SIZE",
        "MPG_EXPIRY_SWEEP_TIME",
        "MPG_START_EXPIRY_CONSUMER",
        "MPG_ALIPAY_APP_ID",
        "MPG_ALIPAY_GATEWAY",
        "MPG_ALIPAY_NOTIFY_URL",
        "MPG_ALIPAY_RETURN_URL",
        "MPG_ALIPAY_FINISH_REDIRECT",
        "MPG_WECHAT_APP_ID",
        "MPG_WECHAT_MCH_ID",
        "MPG_WECHAT_NOTIFY_URL",
    ];

    println!("Current environment values (EXCLUDING variables that contain secrets):");
    DISPLAY_ENVS.iter().for_each(|&name| {
        let val = match env::var(name) {
            Ok(s) => s,
            Err(VarError::NotPresent) => "Not set".into(),
            Err(VarError::NotUnicode(s)) => format!("Invalid value: {}", s.to_string_lossy()),
        };
        println!("  {name:<35} {val:<15}");
    })
}
