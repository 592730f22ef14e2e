//! Test attributes that fail a test instead of letting it hang.
//!
//! `#[timeout]` and `#[timeout(secs)]` wrap a synchronous test.
//! `#[tokio_timeout_test]`, `#[tokio_timeout_test(secs)]` and
//! `#[tokio_timeout_test(secs, start_paused)]` run an async test on a
//! current-thread runtime. With `start_paused` the tokio clock starts frozen and
//! auto-advances, so only the wall-clock guard applies.
//! `#[tokio_timeout_test(secs, multi_thread)]` uses a multi-thread runtime with
//! several workers, for tests that need real contention.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{
    parse::{Parse, ParseStream},
    parse_macro_input, Attribute, Ident, ItemFn, LitInt, Token,
};

const DEFAULT_TIMEOUT_SECS: u64 = 60;
const MULTI_THREAD_WORKERS: usize = 4;

struct TimeoutArgs {
    secs: u64,
    start_paused: bool,
    multi_thread: bool,
}

impl Parse for TimeoutArgs {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let mut args = TimeoutArgs {
            secs: DEFAULT_TIMEOUT_SECS,
            start_paused: false,
            multi_thread: false,
        };
        if input.is_empty() {
            return Ok(args);
        }

        if input.peek(LitInt) {
            let lit: LitInt = input.parse()?;
            args.secs = lit.base10_parse()?;
            if args.secs == 0 {
                return Err(syn::Error::new_spanned(lit, "timeout must be greater than zero"));
            }
            if input.is_empty() {
                return Ok(args);
            }
            input.parse::<Token![,]>()?;
        }

        while !input.is_empty() {
            let flag: Ident = input.parse()?;
            if flag == "start_paused" {
                args.start_paused = true;
            } else if flag == "multi_thread" {
                args.multi_thread = true;
            } else {
                return Err(syn::Error::new_spanned(
                    flag,
                    "unknown option, expected `start_paused` or `multi_thread`",
                ));
            }
            if args.start_paused && args.multi_thread {
                return Err(syn::Error::new_spanned(
                    flag,
                    "`start_paused` requires the current-thread runtime",
                ));
            }
            if !input.is_empty() {
                input.parse::<Token![,]>()?;
            }
        }
        Ok(args)
    }
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as TimeoutArgs);
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

    let attrs = strip(attrs, &["tokio", "test"]);
    let secs = args.secs;
    let builder = if args.multi_thread {
        quote! {
            tokio::runtime::Builder::new_multi_thread()
                .worker_threads(#MULTI_THREAD_WORKERS)
                .enable_all()
                .build()
        }
    } else if args.start_paused {
        quote! {
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .start_paused(true)
                .build()
        }
    } else {
        quote! {
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
        }
    };
    let run = if args.start_paused {
        quote! { runtime.block_on(async move #block); }
    } else {
        quote! {
            runtime.block_on(async {
                tokio::time::timeout(std::time::Duration::from_secs(#secs), async move #block)
                    .await
                    .expect("test timed out");
            });
        }
    };

    let body = quote! {
        || {
            let runtime = #builder.expect("failed to build Tokio runtime");
            #run
        }
    };
    expand(attrs, vis, sig, secs, body)
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as TimeoutArgs);
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &sig.ident,
            "timeout attribute expects a synchronous test function",
        )
        .to_compile_error()
        .into();
    }
    if args.start_paused || args.multi_thread {
        return syn::Error::new_spanned(&sig.ident, "runtime options only apply to async tests")
            .to_compile_error()
            .into();
    }

    let attrs = strip(attrs, &["test"]);
    expand(attrs, vis, sig, args.secs, quote! { || #block })
}

/// Emit a `#[test]` that runs `body` on its own thread and fails after `secs`
/// of wall-clock time.
fn expand(
    attrs: Vec<Attribute>,
    vis: syn::Visibility,
    sig: syn::Signature,
    secs: u64,
    body: TokenStream2,
) -> TokenStream {
    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let timeout_duration = std::time::Duration::from_secs(#secs);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(#body));
                let _ = sender.send(result);
            });
            match receiver.recv_timeout(timeout_duration) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread failed before reporting result")
                }
            }
        }
    })
}

/// Drop attributes whose path is exactly `path`, e.g. `#[tokio::test]`.
fn strip(attrs: Vec<Attribute>, path: &[&str]) -> Vec<Attribute> {
    attrs
        .into_iter()
        .filter(|attr| {
            let segments: Vec<_> = attr.path().segments.iter().collect();
            !(segments.len() == path.len()
                && segments.iter().zip(path).all(|(seg, name)| seg.ident == name))
        })
        .collect()
}
