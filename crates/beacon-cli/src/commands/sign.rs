use beacon_core::signing::sign_payload;
use clap::Subcommand;
use serde_json::{json, Map, Value};

#[derive(Subcommand)]
pub enum SignAction {
    /// Canonicalize and sign a payload, printing the signed form
    Payload {
        #[arg(long)]
        hostname: String,
        /// Endpoint path, e.g. /games/1234/users.json
        #[arg(long)]
        endpoint: String,
        /// JSON object payload
        #[arg(long)]
        payload: String,
        #[arg(long)]
        secret: String,
    },
}

pub fn run(action: SignAction) -> Result<(), Box<dyn std::error::Error>> {
    match action {
        SignAction::Payload {
            hostname,
            endpoint,
            payload,
            secret,
        } => {
            let payload: Map<String, Value> = serde_json::from_str(&payload)?;
            let form = sign_payload(&hostname, &endpoint, &payload, &secret);
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "string_to_sign": form.string_to_sign,
                    "signature": form.signature,
                    "body": form.body,
                }))?
            );
        }
    }
    Ok(())
}
