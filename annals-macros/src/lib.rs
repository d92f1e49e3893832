// These lints are triggered by darling's generated code for
// `#[darling(default)]`.
#![allow(clippy::option_if_let_else)]
#![allow(clippy::needless_continue)]

use darling::{FromDeriveInput, FromVariant, ast::Data, util::Ignored};
use heck::ToKebabCase;
use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{DeriveInput, Ident, parse_macro_input};

/// Returns the override or the default kebab-case name from the ident.
fn default_name(ident: &Ident, name: Option<String>) -> String {
    name.unwrap_or_else(|| ident.to_string().to_kebab_case())
}

/// Configuration for the `#[payload(...)]` attribute on a type.
#[derive(Debug, FromDeriveInput)]
#[darling(attributes(payload), supports(struct_any, enum_any))]
struct PayloadArgs {
    ident: Ident,
    data: Data<PayloadVariant, Ignored>,
    #[darling(default)]
    name: Option<String>,
    #[darling(default)]
    revision: Option<String>,
}

/// Configuration for the `#[payload(...)]` attribute on an enum variant.
#[derive(Debug, FromVariant)]
#[darling(attributes(payload))]
struct PayloadVariant {
    ident: Ident,
    #[darling(default)]
    name: Option<String>,
    #[darling(default)]
    revision: Option<String>,
}

/// Configuration for the `#[saga(...)]` attribute.
#[derive(Debug, FromDeriveInput)]
#[darling(attributes(saga))]
struct SagaArgs {
    ident: Ident,
    #[darling(default)]
    kind: Option<String>,
}

/// Parse derive input with darling and render errors as tokens.
fn parse_or_error<T, F>(input: &DeriveInput, f: F) -> TokenStream2
where
    T: FromDeriveInput,
    F: FnOnce(T) -> TokenStream2,
{
    match T::from_derive_input(input) {
        Ok(args) => f(args),
        Err(err) => err.write_errors(),
    }
}

/// `PayloadType` constructor tokens for a name and optional revision.
fn payload_type_tokens(name: &str, revision: Option<&String>) -> TokenStream2 {
    match revision {
        Some(revision) => quote! {
            ::annals::PayloadType::new(#name).with_revision(#revision)
        },
        None => quote! { ::annals::PayloadType::new(#name) },
    }
}

/// Derives the `Payload` trait, declaring the descriptor a value is stored
/// under.
///
/// # Structs
///
/// The descriptor name defaults to the kebab-case type name.
///
/// # Enums
///
/// Every variant gets its own descriptor, `{type}.{variant}` in kebab-case
/// by default. A variant-level `name` replaces the whole descriptor name.
///
/// # Attributes
///
/// - `name = "..."` - descriptor name (type or variant)
/// - `revision = "..."` - descriptor revision (type-level applies to all
///   variants; variant-level overrides it)
///
/// # Example
///
/// ```ignore
/// #[derive(Serialize, Deserialize, Payload)]
/// #[payload(revision = "2")]
/// enum OrderEvent {
///     Placed { order_id: String },
///     #[payload(name = "order-cancelled")]
///     Cancelled { order_id: String },
/// }
/// ```
#[proc_macro_derive(Payload, attributes(payload))]
pub fn derive_payload(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    derive_payload_impl(&input).into()
}

/// Internal entry point that returns tokens for the payload derive.
fn derive_payload_impl(input: &DeriveInput) -> TokenStream2 {
    // darling's shape check panics on unions, so reject them first.
    if let syn::Data::Union(data) = &input.data {
        return darling::Error::custom("Payload can only be derived for structs and enums")
            .with_span(&data.union_token)
            .write_errors();
    }
    parse_or_error::<PayloadArgs, _>(input, |args| generate_payload_impl(args, input))
}

fn generate_payload_impl(args: PayloadArgs, input: &DeriveInput) -> TokenStream2 {
    let type_name = &args.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();
    let base_name = default_name(type_name, args.name);

    let (names, body) = match args.data {
        Data::Struct(_) => {
            let constructor = payload_type_tokens(&base_name, args.revision.as_ref());
            (vec![base_name], constructor)
        }
        Data::Enum(variants) => {
            if variants.is_empty() {
                return darling::Error::custom("Payload enums must have at least one variant")
                    .with_span(&input.ident)
                    .write_errors();
            }
            let mut names = Vec::with_capacity(variants.len());
            let mut arms = Vec::with_capacity(variants.len());
            for variant in &variants {
                let name = variant.name.clone().unwrap_or_else(|| {
                    format!("{base_name}.{}", variant.ident.to_string().to_kebab_case())
                });
                let revision = variant.revision.as_ref().or(args.revision.as_ref());
                let constructor = payload_type_tokens(&name, revision);
                let ident = &variant.ident;
                arms.push(quote! { Self::#ident { .. } => #constructor, });
                names.push(name);
            }
            (names, quote! { match self { #(#arms)* } })
        }
    };

    quote! {
        impl #impl_generics ::annals::Payload for #type_name #ty_generics #where_clause {
            const TYPE_NAMES: &'static [&'static str] = &[#(#names),*];

            fn payload_type(&self) -> ::annals::PayloadType {
                #body
            }
        }
    }
}

/// Derives the `Saga` trait.
///
/// # Attributes
///
/// - `kind = "name"` - saga type name (default: kebab-case type name)
///
/// # Example
///
/// ```ignore
/// #[derive(Saga)]
/// #[saga(kind = "order-fulfilment")]
/// struct OrderSaga;
/// ```
#[proc_macro_derive(Saga, attributes(saga))]
pub fn derive_saga(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    derive_saga_impl(&input).into()
}

fn derive_saga_impl(input: &DeriveInput) -> TokenStream2 {
    parse_or_error::<SagaArgs, _>(input, |args| {
        let saga_name = &args.ident;
        let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();
        let kind = default_name(saga_name, args.kind);
        quote! {
            impl #impl_generics ::annals::Saga for #saga_name #ty_generics #where_clause {
                const KIND: &'static str = #kind;
            }
        }
    })
}
