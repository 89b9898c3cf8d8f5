//! Listens for a while, suspends, waits, then resumes where it left off.
//!
//! Expects a scores service on `ws://127.0.0.1:7727`, or the endpoint given
//! as the first argument. Set `RUST_LOG=scores_stream_sdk=debug` to see the
//! session lifecycle.

use std::error::Error;
use std::time::Duration;

use futures_util::StreamExt;
use scores_stream_sdk::stream::{
    Event, Intent, SessionNegotiator, SubscriptionStream, LOCAL_ENDPOINT,
};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const LISTEN_FOR: Duration = Duration::from_secs(10);
const PAUSE_FOR: Duration = Duration::from_secs(10);

#[derive(Deserialize)]
struct Score {
    user_id: u64,
    pp: Option<f64>,
    beatmap_id: u64,
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let endpoint = std::env::args()
        .nth(1)
        .unwrap_or_else(|| LOCAL_ENDPOINT.to_string());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(run(endpoint))
}

async fn run(endpoint: String) -> Result<(), Box<dyn Error>> {
    let mut session = SessionNegotiator::new(&endpoint)
        .open(Intent::Fresh)
        .await?;

    let cancel = CancellationToken::new();
    let timer = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(LISTEN_FOR).await;
        timer.cancel();
    });
    print_scores(&mut session, Some(cancel)).await?;

    let suspension = session.suspend().await?;
    println!(
        "suspended at {}, {} scores left unread",
        suspension.checkpoint,
        suspension.undelivered.len()
    );
    for event in &suspension.undelivered {
        print_score(event);
    }

    tokio::time::sleep(PAUSE_FOR).await;

    let mut resumed = SessionNegotiator::new(&endpoint)
        .open(suspension.into_intent())
        .await?;
    print_scores(&mut resumed, None).await?;

    Ok(())
}

async fn print_scores(
    session: &mut SubscriptionStream,
    cancel: Option<CancellationToken>,
) -> Result<(), Box<dyn Error>> {
    let mut events = match cancel {
        Some(cancel) => session.events_until(cancel)?,
        None => session.events()?,
    };

    while let Some(event) = events.next().await {
        print_score(&event?);
    }

    Ok(())
}

fn print_score(event: &Event) {
    match event.json::<Score>() {
        Ok(score) => println!(
            "{} got {}pp on {}",
            score.user_id,
            score.pp.unwrap_or(0.0),
            score.beatmap_id
        ),
        Err(err) => eprintln!("skipping undecodable event {}: {err}", event.sequence()),
    }
}
