use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{Data, DeriveInput, Fields, LitStr, parse_macro_input, spanned::Spanned};

mod sql_object_impl;

/// Turn a trait of SQL operations into a sql object.
///
/// Generates `<Trait>Proxy`, a struct implementing the trait by routing every
/// method into `sqlobject::Dispatcher::dispatch`, together with the
/// declared-type descriptor the handler registry resolves.
///
/// Method markers: `#[sql_query]`, `#[sql_update]`, `#[sql_batch]`,
/// `#[sql_call]` (each with optional SQL text, defaulting to the method
/// name), `#[create_sql_object]`, `#[transaction]` / `#[transaction(Level)]`,
/// `#[max_rows(n)]`, `#[query_timeout_ms(n)]`. Parameters accept
/// `#[bind("name")]`, and `#[bind_bean]` / `#[bind_bean("prefix")]` for
/// structs deriving `BindFields`.
#[proc_macro_attribute]
pub fn sql_object(attr: TokenStream, item: TokenStream) -> TokenStream {
    if !attr.is_empty() {
        return syn::Error::new(
            proc_macro2::Span::call_site(),
            "#[sql_object] does not accept arguments",
        )
        .to_compile_error()
        .into();
    }

    let input = parse_macro_input!(item as syn::ItemTrait);
    match sql_object_impl::expand_sql_object(input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

#[proc_macro_derive(FromRow, attributes(column))]
pub fn derive_from_row(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match expand_from_row(input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

fn expand_from_row(input: DeriveInput) -> syn::Result<TokenStream2> {
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let Data::Struct(data) = &input.data else {
        return Err(syn::Error::new(
            input.span(),
            "#[derive(FromRow)] only supports structs",
        ));
    };

    let construct = match &data.fields {
        Fields::Named(fields) => {
            let mut assignments = Vec::new();
            for field in &fields.named {
                let Some(ident) = field.ident.as_ref() else {
                    continue;
                };
                let column = parse_column_name(&field.attrs)?.unwrap_or_else(|| ident.to_string());
                assignments.push(quote!(#ident: row.get(#column)?));
            }
            quote!(Self { #(#assignments),* })
        }
        Fields::Unnamed(fields) => {
            let values = (0..fields.unnamed.len()).map(|index| quote!(row.get_index(#index)?));
            quote!(Self(#(#values),*))
        }
        Fields::Unit => quote!(Self),
    };

    Ok(quote! {
        impl #impl_generics ::sqlobject::FromRow for #name #ty_generics #where_clause {
            fn from_row(row: ::sqlobject::RowRef<'_>) -> ::sqlobject::Result<Self> {
                ::core::result::Result::Ok(#construct)
            }
        }

        impl #impl_generics ::sqlobject::FromOutcome for #name #ty_generics #where_clause {
            fn from_outcome(outcome: ::sqlobject::Outcome) -> ::sqlobject::Result<Self> {
                ::sqlobject::result::single_row(outcome)
            }
        }
    })
}

/// Bind every named field of a struct as a named argument.
#[proc_macro_derive(BindFields, attributes(column))]
pub fn derive_bind_fields(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match expand_bind_fields(input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

fn expand_bind_fields(input: DeriveInput) -> syn::Result<TokenStream2> {
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let Data::Struct(data) = &input.data else {
        return Err(syn::Error::new(
            input.span(),
            "#[derive(BindFields)] only supports structs",
        ));
    };
    let Fields::Named(fields) = &data.fields else {
        return Err(syn::Error::new(
            input.span(),
            "#[derive(BindFields)] needs named fields to bind",
        ));
    };

    let mut binds = Vec::new();
    for field in &fields.named {
        let Some(ident) = field.ident.as_ref() else {
            continue;
        };
        let column = parse_column_name(&field.attrs)?.unwrap_or_else(|| ident.to_string());
        binds.push(quote! {
            .bind(
                ::sqlobject::core::field_binding_name(prefix, #column),
                ::sqlobject::ToValue::to_value(&self.#ident),
            )
        });
    }

    Ok(quote! {
        impl #impl_generics ::sqlobject::BindFields for #name #ty_generics #where_clause {
            #[allow(unused_variables)]
            fn bind_fields(
                &self,
                prefix: ::core::option::Option<&str>,
                arguments: ::sqlobject::Arguments,
            ) -> ::sqlobject::Arguments {
                arguments #(#binds)*
            }
        }
    })
}

fn parse_column_name(attrs: &[syn::Attribute]) -> syn::Result<Option<String>> {
    let mut column = None;
    for attr in attrs {
        if !attr.path().is_ident("column") {
            continue;
        }
        if column.is_some() {
            return Err(syn::Error::new(
                attr.span(),
                "Duplicate #[column(...)] attribute on field",
            ));
        }
        let lit: LitStr = attr.parse_args()?;
        column = Some(lit.value());
    }
    Ok(column)
}
