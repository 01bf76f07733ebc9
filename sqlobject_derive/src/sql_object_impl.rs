use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::{
    FnArg, Ident, ItemTrait, LitInt, LitStr, Pat, ReturnType, Signature, TraitItem, TraitItemFn,
    Type, TypeParamBound, spanned::Spanned,
};

const STATEMENT_MARKERS: [&str; 4] = ["sql_query", "sql_update", "sql_batch", "sql_call"];

enum MarkerSpec {
    Statement { kind: Ident, sql: Option<LitStr> },
    CreateSqlObject,
    Transaction(Option<Ident>),
    MaxRows(LitInt),
    QueryTimeout(LitInt),
}

impl MarkerSpec {
    fn is_statement(&self) -> bool {
        matches!(self, MarkerSpec::Statement { .. })
    }
}

enum ParamBinding {
    /// One value under this name.
    Value(String),
    /// Every field of a `BindFields` struct, optionally prefixed.
    Bean(Option<String>),
}

struct SqlParam {
    ident: Ident,
    ty: Type,
    binding: ParamBinding,
}

struct SqlMethod {
    sig: Signature,
    markers: Vec<MarkerSpec>,
    params: Vec<SqlParam>,
    ok_type: Type,
    body: Option<syn::Block>,
}

impl SqlMethod {
    fn name(&self) -> String {
        self.sig.ident.to_string()
    }

    fn key_ident(&self) -> Ident {
        format_ident!("__KEY_{}", self.name().to_uppercase())
    }

    fn default_ident(&self) -> Ident {
        format_ident!("__sqlobject_default_{}", self.sig.ident)
    }

    fn create_ident(&self) -> Ident {
        format_ident!("__sqlobject_create_{}", self.sig.ident)
    }

    fn is_statement(&self) -> bool {
        self.markers.iter().any(MarkerSpec::is_statement)
    }

    fn creates_object(&self) -> bool {
        self.markers
            .iter()
            .any(|m| matches!(m, MarkerSpec::CreateSqlObject))
    }
}

enum Mixin {
    Transactional,
    GetHandle,
}

pub(crate) fn expand_sql_object(mut input: ItemTrait) -> syn::Result<TokenStream2> {
    if !input.generics.params.is_empty() {
        return Err(syn::Error::new(
            input.generics.span(),
            "#[sql_object] traits cannot be generic",
        ));
    }

    let trait_ident = input.ident.clone();
    let trait_name = trait_ident.to_string();
    let vis = input.vis.clone();
    let proxy_ident = format_ident!("{}Proxy", trait_ident);
    let proxy_name = proxy_ident.to_string();
    let defaults_ident = format_ident!("__{}SqlObjectDefaults", trait_ident);

    let mixins = collect_mixins(&input)?;

    let mut methods = Vec::new();
    for item in input.items.iter_mut() {
        match item {
            TraitItem::Fn(method) => methods.push(parse_method(method)?),
            other => {
                return Err(syn::Error::new(
                    other.span(),
                    "#[sql_object] traits may only declare methods",
                ));
            }
        }
    }

    let key_consts = methods.iter().map(|method| {
        let key_ident = method.key_ident();
        let name = method.name();
        let param_types = method.params.iter().map(|p| type_key(&p.ty));
        let returns = match &method.sig.output {
            ReturnType::Type(_, ty) => type_key(ty),
            ReturnType::Default => "()".to_string(),
        };
        quote! {
            const #key_ident: ::sqlobject::MethodKey =
                ::sqlobject::MethodKey::new(#name, &[#(#param_types),*], #returns);
        }
    });

    let create_fns = methods.iter().filter(|m| m.creates_object()).map(|method| {
        let create_ident = method.create_ident();
        let ok_type = &method.ok_type;
        quote! {
            fn #create_ident(
                factory: &::std::sync::Arc<::sqlobject::SqlObjectFactory>,
                handle: &::std::sync::Arc<::sqlobject::Handle>,
            ) -> ::sqlobject::Result<::sqlobject::Outcome> {
                ::core::result::Result::Ok(::sqlobject::Outcome::native(
                    factory.attach::<#ok_type>(handle)?,
                ))
            }
        }
    });

    let descriptors = methods
        .iter()
        .map(method_descriptor)
        .collect::<syn::Result<Vec<_>>>()?;

    let supertypes = mixins.iter().map(|mixin| match mixin {
        Mixin::Transactional => quote!(.extends(::sqlobject::object::mixin::transactional())),
        Mixin::GetHandle => quote!(.extends(::sqlobject::object::mixin::get_handle())),
    });

    let mixin_impls = mixins.iter().map(|mixin| match mixin {
        Mixin::Transactional => quote!(impl ::sqlobject::Transactional for #proxy_ident {}),
        Mixin::GetHandle => quote!(impl ::sqlobject::GetHandle for #proxy_ident {}),
    });

    let default_fns = methods.iter().filter_map(|method| {
        let body = method.body.as_ref()?;
        let mut sig = method.sig.clone();
        sig.ident = method.default_ident();
        Some(quote!(#sig #body))
    });

    let proxy_methods = methods
        .iter()
        .map(|method| proxy_method(method, &defaults_ident));

    Ok(quote! {
        #input

        #[doc(hidden)]
        #[allow(non_camel_case_types)]
        #vis trait #defaults_ident: #trait_ident {
            #(#default_fns)*
        }

        impl<__T: #trait_ident + ?Sized> #defaults_ident for __T {}

        #[doc = concat!("Sql object proxy implementing `", #trait_name, "`.")]
        #vis struct #proxy_ident {
            __dispatcher: ::sqlobject::Dispatcher,
        }

        impl #proxy_ident {
            #(#key_consts)*
            #(#create_fns)*
        }

        impl ::std::fmt::Debug for #proxy_ident {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.debug_struct(#proxy_name)
                    .field("dispatcher", &self.__dispatcher)
                    .finish()
            }
        }

        impl ::sqlobject::SqlObject for #proxy_ident {
            fn declared_type() -> ::sqlobject::DeclaredType {
                ::sqlobject::DeclaredType::new::<Self>(#trait_name)
                    #(.method(#descriptors))*
                    #(#supertypes)*
            }

            fn from_dispatcher(dispatcher: ::sqlobject::Dispatcher) -> Self {
                Self { __dispatcher: dispatcher }
            }

            fn dispatcher(&self) -> &::sqlobject::Dispatcher {
                &self.__dispatcher
            }
        }

        #(#mixin_impls)*

        impl #trait_ident for #proxy_ident {
            #(#proxy_methods)*
        }
    })
}

fn collect_mixins(input: &ItemTrait) -> syn::Result<Vec<Mixin>> {
    let mut mixins = Vec::new();
    for bound in &input.supertraits {
        let TypeParamBound::Trait(trait_bound) = bound else {
            continue;
        };
        let Some(segment) = trait_bound.path.segments.last() else {
            continue;
        };
        match segment.ident.to_string().as_str() {
            "Transactional" => mixins.push(Mixin::Transactional),
            "GetHandle" => mixins.push(Mixin::GetHandle),
            "SqlObject" | "Send" | "Sync" => {}
            other => {
                return Err(syn::Error::new(
                    trait_bound.span(),
                    format!(
                        "#[sql_object] traits can only extend Transactional and GetHandle, found {}",
                        other
                    ),
                ));
            }
        }
    }
    Ok(mixins)
}

/// Strip markers and the default body from `method`, returning what the
/// proxy needs to know about it.
fn parse_method(method: &mut TraitItemFn) -> syn::Result<SqlMethod> {
    let sig_span = method.sig.span();
    if method.sig.asyncness.is_some() {
        return Err(syn::Error::new(sig_span, "sql object methods cannot be async"));
    }

    match method.sig.receiver() {
        Some(receiver) if receiver.reference.is_some() && receiver.mutability.is_none() => {}
        _ => {
            return Err(syn::Error::new(
                sig_span,
                "sql object methods must take &self",
            ));
        }
    }

    let mut markers = Vec::new();
    let mut kept = Vec::new();
    for attr in method.attrs.drain(..) {
        match parse_marker(&attr)? {
            Some(marker) => markers.push(marker),
            None => kept.push(attr),
        }
    }
    method.attrs = kept;

    let mut params = Vec::new();
    for input in method.sig.inputs.iter_mut() {
        let FnArg::Typed(pat_type) = input else {
            continue;
        };

        let mut binding = None;
        let mut kept = Vec::new();
        for attr in pat_type.attrs.drain(..) {
            let parsed = if attr.path().is_ident("bind") {
                let lit: LitStr = attr.parse_args()?;
                ParamBinding::Value(lit.value())
            } else if attr.path().is_ident("bind_bean") {
                match &attr.meta {
                    syn::Meta::Path(_) => ParamBinding::Bean(None),
                    _ => ParamBinding::Bean(Some(attr.parse_args::<LitStr>()?.value())),
                }
            } else {
                kept.push(attr);
                continue;
            };
            if binding.is_some() {
                return Err(syn::Error::new(
                    attr.span(),
                    "A parameter takes at most one of #[bind] and #[bind_bean]",
                ));
            }
            binding = Some(parsed);
        }
        pat_type.attrs = kept;

        let Pat::Ident(pat_ident) = pat_type.pat.as_ref() else {
            return Err(syn::Error::new(
                pat_type.pat.span(),
                "sql object parameters must be plain identifiers",
            ));
        };
        let ident = pat_ident.ident.clone();
        let binding = binding.unwrap_or_else(|| {
            ParamBinding::Value(ident.to_string().trim_start_matches('_').to_string())
        });
        params.push(SqlParam {
            binding,
            ident,
            ty: pat_type.ty.as_ref().clone(),
        });
    }

    let ok_type = match &method.sig.output {
        ReturnType::Type(_, ty) => extract_result_ok_type(ty),
        ReturnType::Default => None,
    }
    .ok_or_else(|| syn::Error::new(sig_span, "sql object methods must return Result<T>"))?;

    let body = method.default.take();
    if body.is_some() {
        method.semi_token = Some(Default::default());
    }

    Ok(SqlMethod {
        sig: method.sig.clone(),
        markers,
        params,
        ok_type,
        body,
    })
}

fn parse_marker(attr: &syn::Attribute) -> syn::Result<Option<MarkerSpec>> {
    let path = attr.path();
    let Some(ident) = path.get_ident() else {
        return Ok(None);
    };
    let name = ident.to_string();

    if STATEMENT_MARKERS.contains(&name.as_str()) {
        let sql = match &attr.meta {
            syn::Meta::Path(_) => None,
            syn::Meta::List(_) => Some(attr.parse_args::<LitStr>()?),
            syn::Meta::NameValue(_) => {
                return Err(syn::Error::new(
                    attr.span(),
                    format!("Use #[{}] or #[{}(\"...\")]", name, name),
                ));
            }
        };
        let kind = match name.as_str() {
            "sql_query" => format_ident!("SqlQuery"),
            "sql_update" => format_ident!("SqlUpdate"),
            "sql_batch" => format_ident!("SqlBatch"),
            _ => format_ident!("SqlCall"),
        };
        return Ok(Some(MarkerSpec::Statement { kind, sql }));
    }

    match name.as_str() {
        "create_sql_object" => Ok(Some(MarkerSpec::CreateSqlObject)),
        "transaction" => match &attr.meta {
            syn::Meta::Path(_) => Ok(Some(MarkerSpec::Transaction(None))),
            _ => {
                let level: Ident = attr.parse_args()?;
                Ok(Some(MarkerSpec::Transaction(Some(isolation_variant(&level)?))))
            }
        },
        "max_rows" => {
            let lit: LitInt = attr.parse_args()?;
            lit.base10_parse::<usize>()?;
            Ok(Some(MarkerSpec::MaxRows(lit)))
        }
        "query_timeout_ms" => {
            let lit: LitInt = attr.parse_args()?;
            lit.base10_parse::<u64>()?;
            Ok(Some(MarkerSpec::QueryTimeout(lit)))
        }
        _ => Ok(None),
    }
}

fn isolation_variant(level: &Ident) -> syn::Result<Ident> {
    let normalized = level.to_string().replace('_', "").to_lowercase();
    let variant = match normalized.as_str() {
        "readuncommitted" => "ReadUncommitted",
        "readcommitted" => "ReadCommitted",
        "repeatableread" => "RepeatableRead",
        "serializable" => "Serializable",
        _ => {
            return Err(syn::Error::new(
                level.span(),
                "Unknown isolation level. Supported: ReadUncommitted, ReadCommitted, RepeatableRead, Serializable",
            ));
        }
    };
    Ok(Ident::new(variant, level.span()))
}

fn method_descriptor(method: &SqlMethod) -> syn::Result<TokenStream2> {
    let key_ident = method.key_ident();
    let mut descriptor = quote!(::sqlobject::MethodDescriptor::new(Self::#key_ident));

    for marker in &method.markers {
        let marker_tokens = match marker {
            MarkerSpec::Statement { kind, sql } => {
                let sql = match sql {
                    Some(lit) => quote!(::core::option::Option::Some(#lit)),
                    None => quote!(::core::option::Option::None),
                };
                quote!(::sqlobject::Marker::#kind(#sql))
            }
            MarkerSpec::CreateSqlObject => {
                let create_ident = method.create_ident();
                quote!(::sqlobject::Marker::CreateSqlObject(Self::#create_ident))
            }
            MarkerSpec::Transaction(Some(level)) => quote!(::sqlobject::Marker::Transaction(
                ::core::option::Option::Some(::sqlobject::IsolationLevel::#level)
            )),
            MarkerSpec::Transaction(None) => {
                quote!(::sqlobject::Marker::Transaction(::core::option::Option::None))
            }
            MarkerSpec::MaxRows(lit) => quote!(::sqlobject::Marker::MaxRows(#lit)),
            MarkerSpec::QueryTimeout(lit) => quote!(::sqlobject::Marker::QueryTimeout(
                ::std::time::Duration::from_millis(#lit)
            )),
        };
        descriptor = quote!(#descriptor.marker(#marker_tokens));
    }

    let bind_names = method.params.iter().map(|p| match &p.binding {
        ParamBinding::Value(name) | ParamBinding::Bean(Some(name)) => {
            quote!(::core::option::Option::Some(#name))
        }
        ParamBinding::Bean(None) => quote!(::core::option::Option::None),
    });
    descriptor = quote!(#descriptor.params(&[#(#bind_names),*]));

    if method.body.is_some() {
        descriptor = quote!(#descriptor.with_default());
    }
    Ok(descriptor)
}

fn proxy_method(method: &SqlMethod, defaults_ident: &Ident) -> TokenStream2 {
    let sig = &method.sig;
    let name = method.name();
    let key_ident = method.key_ident();
    let ok_type = &method.ok_type;
    let idents: Vec<&Ident> = method.params.iter().map(|p| &p.ident).collect();

    let arguments = if method.is_statement() {
        let binds = method.params.iter().map(|p| {
            let ident = &p.ident;
            match &p.binding {
                ParamBinding::Value(name) => {
                    quote!(.bind(#name, ::sqlobject::ToValue::to_value(&#ident)))
                }
                ParamBinding::Bean(Some(prefix)) => {
                    quote!(.bind_bean(::core::option::Option::Some(#prefix), &#ident))
                }
                ParamBinding::Bean(None) => {
                    quote!(.bind_bean(::core::option::Option::None, &#ident))
                }
            }
        });
        quote! {
            let __arguments = ::sqlobject::Arguments::new() #(#binds)*;
        }
    } else {
        quote!(let __arguments = ::sqlobject::Arguments::new();)
    };

    let default_action = method.body.as_ref().map(|_| {
        let default_ident = method.default_ident();
        quote! {
            let mut __pending = ::core::option::Option::Some((#(#idents,)*));
            let __invocation = __invocation.default_action(move || {
                let (#(#idents,)*) = __pending.take().ok_or_else(|| {
                    ::sqlobject::DbError::ConfigurationFault(::std::format!(
                        "Default body of '{}' cannot run twice in one call",
                        #name
                    ))
                })?;
                let __value = <Self as #defaults_ident>::#default_ident(self, #(#idents),*)?;
                ::core::result::Result::Ok(::sqlobject::Outcome::native(__value))
            });
        }
    });

    let (stub, convert) = if method.is_statement() {
        (
            quote!(<#ok_type as ::sqlobject::FromOutcome>::stub()),
            quote!(::sqlobject::materialize::<#ok_type>(__outcome)),
        )
    } else {
        (
            quote!(::core::option::Option::None),
            quote!(__outcome.into_native::<#ok_type>()),
        )
    };

    quote! {
        #[allow(unused_variables)]
        #sig {
            #arguments
            let __invocation =
                ::sqlobject::Invocation::new(Self::#key_ident).arguments(__arguments);
            #default_action
            let __outcome = ::sqlobject::SqlObject::dispatcher(self).dispatch(__invocation, #stub)?;
            #convert
        }
    }
}

/// Type rendered the way it is written, for method identity.
fn type_key(ty: &Type) -> String {
    let raw = quote!(#ty).to_string();
    let is_word = |c: char| c.is_alphanumeric() || c == '_' || c == '\'';
    let chars: Vec<char> = raw.chars().collect();
    let mut key = String::with_capacity(raw.len());
    for (index, c) in chars.iter().enumerate() {
        if *c != ' ' {
            key.push(*c);
            continue;
        }
        let prev_is_word = key.chars().last().is_some_and(is_word);
        let next_is_word = chars.get(index + 1).copied().is_some_and(is_word);
        if prev_is_word && next_is_word {
            key.push(' ');
        }
    }
    key
}

fn extract_result_ok_type(ty: &Type) -> Option<Type> {
    let Type::Path(type_path) = ty else {
        return None;
    };
    let segment = type_path.path.segments.last()?;
    if segment.ident != "Result" {
        return None;
    }
    let syn::PathArguments::AngleBracketed(arguments) = &segment.arguments else {
        return None;
    };
    arguments.args.iter().find_map(|arg| match arg {
        syn::GenericArgument::Type(ok_ty) => Some(ok_ty.clone()),
        _ => None,
    })
}
