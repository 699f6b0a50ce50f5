#![forbid(unsafe_code)]

use colored::*;

fn main() {
    println!("{}", "duochain CLI".bright_cyan().bold());
    println!("{}", "------------".bright_cyan());
    println!();
    println!(
        "{}",
        "This is the main entry point, but the node runs as a separate binary.".yellow()
    );
    println!(
        "{}",
        "Use 'cargo run --bin <binary_name>' to run a specific command.".yellow()
    );
    println!();
    println!("{}", "Available binaries:".bright_green().underline());
    println!("  - {}", "duochain-node".bright_white());
    println!();
    println!("{}", "Example:".bright_green().underline());
    println!("{}", "  cargo run --bin duochain-node -- --mode pos --p2p-port 9001 --peer 127.0.0.1:9000".italic());
    println!();
    println!("{}", "Once running, the HTTP API is under /api:".bright_green().underline());
    println!("  GET  {}", "/api/chain, /api/chain/height, /api/block/:index".bright_white());
    println!("  POST {}", "/api/data {\"payload\": 72, \"validator_id\": \"alice\"}".bright_white());
    println!("  POST {}", "/api/chain (a full chain offered for reconciliation)".bright_white());
    println!("  GET  {}", "/api/validators, /api/round, /api/peers, /api/health".bright_white());
}
