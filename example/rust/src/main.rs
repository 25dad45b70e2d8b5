use std::{path::PathBuf, thread::sleep, time::Duration};

use toggles::{Context, FlagEvaluator};

/// First CLI argument, else `TOGGLES_DIR`, else `../values`.
fn flags_dir() -> PathBuf {
    std::env::args_os()
        .nth(1)
        .or_else(|| std::env::var_os("TOGGLES_DIR"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("../values"))
}

/// An example usage of the Rust toggles client library
/// Every 3 seconds, reloads the flag files and prints how three sample users
/// see the `new-checkout` and `checkout-experiment` flags.
///
/// Editing the JSON files in the flags directory is reflected in stdout
/// ^C to exit
fn main() -> anyhow::Result<()> {
    let dir = flags_dir();
    let evaluator = FlagEvaluator::from_directory(&dir)?;

    let users = [
        Context::new().with("userId", "user-1").with("plan", "free"),
        Context::new()
            .with("userId", "user-2")
            .with("plan", "premium")
            .with("group", "B"),
        Context::new()
            .with("userId", "user-3")
            .with("email", "dev@example.com"),
    ];

    loop {
        sleep(Duration::from_secs(3));
        let loaded = evaluator.reload_from(&dir)?;
        println!("loaded {loaded} flag(s) from {}", dir.display());

        for user in &users {
            let payload = evaluator
                .variant_payload("checkout-experiment", Some(user))
                .unwrap_or(serde_json::Value::Null);
            println!(
                "{}: new-checkout={} | checkout-experiment={:?} {}",
                user.get("userId").map(ToString::to_string).unwrap_or_default(),
                evaluator.is_enabled("new-checkout", Some(user)),
                evaluator.get_variant("checkout-experiment", Some(user)),
                payload,
            );
        }
    }
}
