use std::env;

use govfx::auth::OperatorAuth;
use govfx::kill_switch::{ACTION_ARM, ACTION_RESET};

fn main() {
    let action = env::args().nth(1).unwrap_or_default();
    if action != ACTION_ARM && action != ACTION_RESET {
        eprintln!("usage: operator_token <{}|{}> [nonce]", ACTION_ARM, ACTION_RESET);
        std::process::exit(2);
    }
    let nonce = env::args()
        .nth(2)
        .unwrap_or_else(|| format!("{:016x}", rand::random::<u64>()));
    let secret = env::var("OPERATOR_SECRET").unwrap_or_default();
    if secret.is_empty() {
        eprintln!("OPERATOR_SECRET is not set");
        std::process::exit(2);
    }
    match OperatorAuth::new(&secret).issue(&action, &nonce) {
        Ok(token) => println!("{}", token),
        Err(err) => {
            eprintln!("cannot issue token: {}", err);
            std::process::exit(1);
        }
    }
}
