use std::collections::BTreeSet;

use relaypool::{Pubkey, RelayUrl};
use tracing::error;

#[derive(Debug, Default, PartialEq)]
pub struct Args {
    pub global: bool,
    pub authors: Vec<Pubkey>,
    pub me: Option<Pubkey>,
    pub relays: Vec<RelayUrl>,
    pub config: Option<String>,
    pub logdir: Option<String>,
    pub limit: Option<u64>,
    pub pages: usize,
    pub live: bool,
}

fn next_value<'a>(args: &'a [String], i: &mut usize, what: &str) -> Option<&'a String> {
    *i += 1;
    let value = args.get(*i);
    if value.is_none() {
        error!("{what} argument missing?");
    }
    value
}

impl Args {
    // parse arguments, return set of unrecognized args
    pub fn parse(args: &[String]) -> (Self, BTreeSet<String>) {
        let mut unrecognized_args = BTreeSet::new();
        let mut res = Args::default();

        let mut i = 0;
        let len = args.len();
        while i < len {
            let arg = &args[i];

            if arg == "--global" {
                res.global = true;
            } else if arg == "--live" {
                res.live = true;
            } else if arg == "-a" || arg == "--author" || arg == "--npub" {
                let Some(value) = next_value(args, &mut i, "author") else {
                    continue;
                };
                match Pubkey::parse(value) {
                    Ok(pk) => res.authors.push(pk),
                    Err(_) => error!(
                        "failed to parse {} argument. Make sure to use hex or npub.",
                        arg
                    ),
                }
            } else if arg == "--me" {
                let Some(value) = next_value(args, &mut i, "me") else {
                    continue;
                };
                match Pubkey::parse(value) {
                    Ok(pk) => res.me = Some(pk),
                    Err(_) => error!("failed to parse --me. Make sure to use hex or npub."),
                }
            } else if arg == "-r" || arg == "--relay" {
                let Some(value) = next_value(args, &mut i, "relay") else {
                    continue;
                };
                match RelayUrl::new(value) {
                    Ok(url) => res.relays.push(url),
                    Err(err) => error!("skipping relay {value}: {err}"),
                }
            } else if arg == "--config" {
                let Some(value) = next_value(args, &mut i, "config") else {
                    continue;
                };
                res.config = Some(value.clone());
            } else if arg == "--logdir" {
                let Some(value) = next_value(args, &mut i, "logdir") else {
                    continue;
                };
                res.logdir = Some(value.clone());
            } else if arg == "--limit" {
                let Some(value) = next_value(args, &mut i, "limit") else {
                    continue;
                };
                match value.parse() {
                    Ok(limit) => res.limit = Some(limit),
                    Err(err) => error!("bad --limit {value}: {err}"),
                }
            } else if arg == "--pages" {
                let Some(value) = next_value(args, &mut i, "pages") else {
                    continue;
                };
                match value.parse() {
                    Ok(pages) => res.pages = pages,
                    Err(err) => error!("bad --pages {value}: {err}"),
                }
            } else {
                unrecognized_args.insert(arg.clone());
            }

            i += 1;
        }

        (res, unrecognized_args)
    }
}
