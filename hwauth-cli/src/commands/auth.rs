//! `device-auth` and `card-auth` commands.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use console::style;
use hwauth::{
    CancelToken, CardOutcome, CardSequence, CardSlot, ConnectionContext, Engine, ErrorKind,
    HttpServer, SequenceVerdict,
};
use log::{info, warn};

use super::{Reporter, ask_retry, engine, hint, open_device};
use crate::config::Config;
use crate::{Cli, CliError};

/// Automatic retries per card with `--retry`.
const MAX_AUTO_RETRIES: u32 = 3;

/// Authenticate the device, offering a retry while the failure allows one.
///
/// Prints the verified serial to stdout.
pub(crate) fn cmd_device_auth(cli: &Cli, config: &mut Config, cancel: &CancelToken) -> Result<()> {
    let engine = engine(cli, config, cancel)?;
    let ctx = open_device(cli, config)?;
    let mut reporter = Reporter::new(cli.quiet);

    let mut result = engine.authenticate_device(&ctx, &mut reporter);
    let verified = loop {
        let err = match result {
            Ok(verified) => break verified,
            Err(err) => err,
        };
        let failure = err.classify();
        if let Some(hint) = hint(failure.kind) {
            warn!("{hint}");
        }
        if matches!(err, hwauth::Error::Cancelled)
            || !failure.retryable
            || failure.terminal
            || !ask_retry(cli, &format!("Device authentication failed ({}). Retry?", failure.kind))?
        {
            return Err(err.into());
        }
        result = engine.retry_device_auth(&ctx, failure, &mut reporter);
    };

    if !cli.quiet {
        eprintln!(
            "\n{} {}",
            style("🎉").green().bold(),
            style("The wallet is genuine").green().bold()
        );
    }
    println!("{}", hex::encode(&verified.serial));
    Ok(())
}

/// Authenticate the four cards, then retry failed ones.
///
/// With `retry` failed cards are retried without asking, up to
/// [`MAX_AUTO_RETRIES`] times each.
pub(crate) fn cmd_card_auth(
    cli: &Cli,
    config: &mut Config,
    cancel: &CancelToken,
    retry: bool,
) -> Result<()> {
    let engine = engine(cli, config, cancel)?;
    let mut ctx = open_device(cli, config)?;
    let mut reporter = Reporter::new(cli.quiet);
    let mut seq = CardSequence::new();

    let first = engine.authenticate_cards(&ctx, &mut seq, &mut reporter);
    let mut verdict = settle(cli, config, &engine, &mut ctx, &mut seq, &mut reporter, first)?;

    let mut attempts: BTreeMap<CardSlot, u32> = BTreeMap::new();
    let mut given_up: BTreeSet<CardSlot> = BTreeSet::new();
    while verdict != SequenceVerdict::AllVerified {
        let Some((slot, kind)) = next_retryable(seq.outcomes(), &given_up) else {
            break;
        };
        let tried = attempts.entry(slot).or_default();
        let again = if retry {
            *tried < MAX_AUTO_RETRIES
        } else {
            ask_retry(cli, &format!("Card {slot} failed ({kind}). Retry it?"))?
        };
        if !again {
            given_up.insert(slot);
            continue;
        }
        *tried += 1;
        info!("Retrying card {slot} (attempt {})", *tried + 1);

        let result = engine.retry_card(&ctx, &mut seq, slot, &mut reporter);
        verdict = settle(cli, config, &engine, &mut ctx, &mut seq, &mut reporter, result)?;
    }
    drop(reporter);

    if !cli.quiet {
        eprintln!();
        for (slot, outcome) in seq.outcomes() {
            let mark = match outcome {
                CardOutcome::Verified => style("✓").green(),
                CardOutcome::Pending | CardOutcome::InProgress => style("•").yellow(),
                CardOutcome::Failed(_) | CardOutcome::PairingFailed => style("✗").red(),
            };
            eprintln!("  {mark} Card {slot}: {outcome}");
        }
    }

    match verdict {
        SequenceVerdict::AllVerified => {
            if !cli.quiet {
                eprintln!(
                    "\n{} {}",
                    style("🎉").green().bold(),
                    style("All cards verified").green().bold()
                );
            }
            Ok(())
        },
        _ if has_terminal_failure(&seq) => Err(CliError::Terminal(format!(
            "card authentication failed: {verdict}"
        ))
        .into()),
        _ => Err(anyhow::anyhow!("card authentication failed: {verdict}")),
    }
}

/// Resolve a sequence run, reconnecting when the link dropped mid-card.
fn settle(
    cli: &Cli,
    config: &mut Config,
    engine: &Engine<HttpServer>,
    ctx: &mut ConnectionContext,
    seq: &mut CardSequence,
    reporter: &mut Reporter,
    mut result: hwauth::Result<SequenceVerdict>,
) -> Result<SequenceVerdict> {
    loop {
        match result {
            Ok(verdict) => return Ok(verdict),
            Err(err) if seq.is_frozen() => {
                warn!("Card sequence interrupted: {err}");
                if !ask_retry(cli, "The wallet disconnected. Reconnect it and resume?")? {
                    return Err(err.into());
                }
                *ctx = open_device(cli, config)?;
                result = engine.resume_cards(ctx, seq, reporter);
            },
            Err(err) => return Err(err.into()),
        }
    }
}

/// First failed card outside `given_up` whose failure allows a retry.
fn next_retryable(
    outcomes: impl IntoIterator<Item = (CardSlot, CardOutcome)>,
    given_up: &BTreeSet<CardSlot>,
) -> Option<(CardSlot, ErrorKind)> {
    outcomes.into_iter().find_map(|(slot, outcome)| match outcome {
        CardOutcome::Failed(kind) if kind.retryable() && !given_up.contains(&slot) => {
            Some((slot, kind))
        },
        _ => None,
    })
}

fn has_terminal_failure(seq: &CardSequence) -> bool {
    seq.outcomes()
        .any(|(_, outcome)| outcome.error().is_some_and(ErrorKind::terminal))
}
