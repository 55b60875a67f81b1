//! Augment the development of primitives with procedural macros.

use proc_macro::TokenStream;
use proc_macro2::Span;
use quote::quote;
use syn::{parse_macro_input, Error, Ident, ItemFn, LitStr};

/// Levels accepted by [macro@test_traced].
const LEVELS: [&str; 5] = ["TRACE", "DEBUG", "INFO", "WARN", "ERROR"];

/// Run a test function with a `tracing` subscriber installed for its duration.
///
/// Log output is written to the test writer (captured unless `--nocapture` is
/// passed) at the provided level, or `DEBUG` if none is given. The annotated
/// crate must depend on `tracing` and `tracing-subscriber`.
///
/// # Example
///
/// ```rust,ignore
/// use spigot_macros::test_traced;
///
/// #[test_traced("INFO")]
/// fn test_info_level() {
///     tracing::info!("this is an info log");
///     tracing::debug!("this is a debug log (won't be shown)");
/// }
/// ```
#[proc_macro_attribute]
pub fn test_traced(attr: TokenStream, item: TokenStream) -> TokenStream {
    let input = parse_macro_input!(item as ItemFn);

    // Parse the (optional) level
    let level = if attr.is_empty() {
        Ident::new("DEBUG", Span::call_site())
    } else {
        let literal = parse_macro_input!(attr as LitStr);
        let value = literal.value().to_uppercase();
        if !LEVELS.contains(&value.as_str()) {
            return Error::new(
                literal.span(),
                format!("invalid level `{value}`, expected one of {LEVELS:?}"),
            )
            .to_compile_error()
            .into();
        }
        Ident::new(&value, literal.span())
    };

    let attrs = &input.attrs;
    let vis = &input.vis;
    let sig = &input.sig;
    let block = &input.block;
    let expanded = quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let subscriber = ::tracing_subscriber::fmt()
                .with_test_writer()
                .with_max_level(::tracing::Level::#level)
                .with_line_number(true)
                .finish();
            let dispatcher = ::tracing::Dispatch::new(subscriber);
            ::tracing::dispatcher::with_default(&dispatcher, || #block)
        }
    };
    TokenStream::from(expanded)
}
