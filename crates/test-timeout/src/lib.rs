//! Attribute macros that run a test on a watchdog thread and fail it once a
//! deadline passes.
//!
//! Both macros accept an optional budget in seconds (`#[timeout(5)]`). The
//! `SANDPOLIS_TEST_TIMEOUT_SECS` environment variable, read when the test
//! runs, overrides every budget. `tokio_timeout_test` additionally accepts
//! `paused` to start the runtime with a frozen clock, or `multi_thread` to
//! run on a two-worker runtime instead of the current thread.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::punctuated::Punctuated;
use syn::{parse_macro_input, Attribute, ItemFn, Token};

const DEFAULT_TIMEOUT_SECS: u64 = 60;
const TIMEOUT_ENV: &str = "SANDPOLIS_TEST_TIMEOUT_SECS";

enum Arg {
    Seconds(syn::LitInt),
    Flag(syn::Ident),
}

impl Parse for Arg {
    fn parse(input: ParseStream<'_>) -> syn::Result<Self> {
        if input.peek(syn::LitInt) {
            input.parse().map(Arg::Seconds)
        } else {
            input.parse().map(Arg::Flag)
        }
    }
}

struct Options {
    seconds: u64,
    paused: bool,
    multi_thread: bool,
}

impl Parse for Options {
    fn parse(input: ParseStream<'_>) -> syn::Result<Self> {
        let mut options = Options {
            seconds: DEFAULT_TIMEOUT_SECS,
            paused: false,
            multi_thread: false,
        };
        for arg in Punctuated::<Arg, Token![,]>::parse_terminated(input)? {
            match arg {
                Arg::Seconds(lit) => {
                    let seconds: u64 = lit.base10_parse()?;
                    if seconds == 0 {
                        return Err(syn::Error::new_spanned(lit, "timeout must be greater than zero"));
                    }
                    options.seconds = seconds;
                }
                Arg::Flag(ident) if ident == "paused" => options.paused = true,
                Arg::Flag(ident) if ident == "multi_thread" => options.multi_thread = true,
                Arg::Flag(ident) => {
                    return Err(syn::Error::new_spanned(
                        ident,
                        "unknown option; expected `paused` or `multi_thread`",
                    ));
                }
            }
        }
        if options.paused && options.multi_thread {
            return Err(input.error("`paused` needs the current-thread runtime"));
        }
        Ok(options)
    }
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let options = parse_macro_input!(attr as Options);
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }
    sig.asyncness = None;

    if options.paused {
        if let Some(conflict) = attrs.iter().find(|attr| is_path(attr, &["tokio", "test"])) {
            return syn::Error::new_spanned(conflict, "remove #[tokio::test] when using `paused`")
                .to_compile_error()
                .into();
        }
    }

    let attrs = strip(attrs, &["tokio", "test"]);
    // start_paused needs tokio's test-util feature, so only emit it on request
    let clock = if options.paused {
        quote! { .start_paused(true) }
    } else {
        quote! {}
    };
    let builder = if options.multi_thread {
        quote! { tokio::runtime::Builder::new_multi_thread().worker_threads(2) }
    } else {
        quote! { tokio::runtime::Builder::new_current_thread() }
    };
    let body = quote! {
        let runtime = #builder
            .enable_all()
            #clock
            .build()
            .expect("failed to build Tokio runtime");
        runtime.block_on(async move #block);
    };
    let watchdog = watchdog(options.seconds, body);

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #watchdog
        }
    })
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let options = parse_macro_input!(attr as Options);
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &sig.ident,
            "timeout expects a synchronous test function; use tokio_timeout_test",
        )
        .to_compile_error()
        .into();
    }
    if options.paused || options.multi_thread {
        return syn::Error::new_spanned(
            &sig.ident,
            "runtime options only apply to tokio_timeout_test",
        )
        .to_compile_error()
        .into();
    }

    let attrs = strip(attrs, &["test"]);
    let watchdog = watchdog(options.seconds, quote! { #block });

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #watchdog
        }
    })
}

/// Runs `body` on its own thread and waits at most the configured budget.
fn watchdog(seconds: u64, body: TokenStream2) -> TokenStream2 {
    quote! {
        let budget = std::env::var(#TIMEOUT_ENV)
            .ok()
            .and_then(|value| value.trim().parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .unwrap_or(#seconds);
        let budget = std::time::Duration::from_secs(budget);
        let (sender, receiver) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| { #body }));
            let _ = sender.send(result);
        });
        match receiver.recv_timeout(budget) {
            Ok(Ok(_)) => {}
            Ok(Err(payload)) => std::panic::resume_unwind(payload),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                panic!("test exceeded its {:?} budget", budget)
            }
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                panic!("test thread exited before reporting a result")
            }
        }
    }
}

fn strip(attrs: Vec<Attribute>, path: &[&str]) -> Vec<Attribute> {
    attrs.into_iter().filter(|attr| !is_path(attr, path)).collect()
}

fn is_path(attr: &Attribute, path: &[&str]) -> bool {
    let segments = &attr.path().segments;
    segments.len() == path.len()
        && segments
            .iter()
            .zip(path)
            .all(|(segment, expected)| segment.ident == *expected)
}
