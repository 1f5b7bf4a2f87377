// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Multi-process integration test runner for the collage substrate
//!
//! Each test case runs as its own process, either as the serving side
//! (no peer arguments) or as the connecting side (with a peer port). The
//! process exit code is the test verdict: zero for success.

use std::env;

mod tests;

use clap::Parser;

/// Test-suite runner
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    test: tests::TestCase,
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() {
    let args = Args::parse();

    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "debug");
    }
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let code = tokio::select! {
        code = tests::run(args.test) => code,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("CTRL-C pressed, exiting test");
            -2
        }
    };
    tracing::info!("Test exiting with code {code}");
    std::process::exit(code);
}
