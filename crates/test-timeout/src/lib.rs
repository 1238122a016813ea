//! Test attributes that fail a test instead of letting it hang.
//!
//! `#[timeout]` wraps a synchronous test, `#[tokio_timeout_test]` an async one
//! (on a current-thread runtime with time and io enabled). Both take an
//! optional limit in seconds; `BEACH_TEST_TIMEOUT_SECS` overrides it at run
//! time, which helps on slow CI machines.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let secs = match parse_timeout(attr) {
        Ok(secs) => secs,
        Err(err) => return err.to_compile_error().into(),
    };
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &sig.ident,
            "use #[tokio_timeout_test] for async test functions",
        )
        .to_compile_error()
        .into();
    }

    let attrs = strip_test_attrs(attrs);
    let body = quote! { #block };
    let harness = watchdog(secs, body);
    quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #harness
        }
    }
    .into()
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let secs = match parse_timeout(attr) {
        Ok(secs) => secs,
        Err(err) => return err.to_compile_error().into(),
    };
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "#[tokio_timeout_test] expects an async function",
        )
        .to_compile_error()
        .into();
    }
    sig.asyncness = None;

    let attrs = strip_test_attrs(attrs);
    let body = quote! {
        let runtime = ::tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("build test runtime");
        runtime.block_on(async move #block)
    };
    let harness = watchdog(secs, body);
    quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #harness
        }
    }
    .into()
}

/// Runs `body` on a worker thread and panics if it does not report back in
/// time. Panics inside the body are re-raised on the test thread.
fn watchdog(secs: u64, body: TokenStream2) -> TokenStream2 {
    quote! {
        let limit = ::std::env::var("BEACH_TEST_TIMEOUT_SECS")
            .ok()
            .and_then(|value| value.trim().parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .unwrap_or(#secs);
        let limit = ::std::time::Duration::from_secs(limit);
        let (done_tx, done_rx) = ::std::sync::mpsc::channel();
        ::std::thread::Builder::new()
            .name("test-body".into())
            .spawn(move || {
                let outcome = ::std::panic::catch_unwind(::std::panic::AssertUnwindSafe(|| { #body }));
                let _ = done_tx.send(outcome);
            })
            .expect("spawn test thread");
        match done_rx.recv_timeout(limit) {
            Ok(Ok(())) => {}
            Ok(Err(payload)) => ::std::panic::resume_unwind(payload),
            Err(::std::sync::mpsc::RecvTimeoutError::Timeout) => {
                panic!("test exceeded {}s", limit.as_secs())
            }
            Err(::std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                panic!("test thread exited without reporting")
            }
        }
    }
}

fn parse_timeout(attr: TokenStream) -> syn::Result<u64> {
    if attr.is_empty() {
        return Ok(DEFAULT_TIMEOUT_SECS);
    }
    let lit: LitInt = syn::parse(attr)?;
    let secs: u64 = lit.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new_spanned(lit, "timeout must be at least one second"));
    }
    Ok(secs)
}

/// Drops `#[test]` and `#[tokio::test]` so the generated `#[test]` is the only one.
fn strip_test_attrs(attrs: Vec<Attribute>) -> Vec<Attribute> {
    attrs
        .into_iter()
        .filter(|attr| {
            let path: Vec<String> = attr
                .path()
                .segments
                .iter()
                .map(|segment| segment.ident.to_string())
                .collect();
            !matches!(path.as_slice(), [name] if name == "test")
                && !matches!(path.as_slice(), [scope, name] if scope == "tokio" && name == "test")
        })
        .collect()
}
