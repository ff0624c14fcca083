use proc_macro::TokenStream;
use proc_macro2::Span;
use quote::quote;
use syn::{
    Data, DeriveInput, Error, ExprPath, Fields, LitInt, LitStr, Result, meta::ParseNestedMeta,
    parse_macro_input,
};

/// Implements `fieldsync::upcasting::Upcaster` for a unit struct.
///
/// ```ignore
/// #[derive(Upcaster)]
/// #[upcaster(collection = "faults", from_version = 1, transform = add_severity)]
/// struct FaultV1ToV2;
/// ```
///
/// `to_version` defaults to `from_version + 1` and must be greater than it.
/// `transform` names a `fn(&Value) -> fieldsync::Result<Value>`, either as a bare
/// path or as a string literal.
#[proc_macro_derive(Upcaster, attributes(upcaster))]
pub fn derive_upcaster(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    expand(&input)
        .unwrap_or_else(Error::into_compile_error)
        .into()
}

#[derive(Default)]
struct Step {
    collection: Option<LitStr>,
    from_version: Option<(i32, Span)>,
    to_version: Option<(i32, Span)>,
    transform: Option<ExprPath>,
}

impl Step {
    fn parse_entry(&mut self, meta: ParseNestedMeta<'_>) -> Result<()> {
        let key = meta
            .path
            .get_ident()
            .map(ToString::to_string)
            .unwrap_or_default();
        match key.as_str() {
            "collection" => {
                let lit: LitStr = meta.value()?.parse()?;
                if lit.value().trim().is_empty() {
                    return Err(Error::new(lit.span(), "collection name cannot be empty"));
                }
                set_once(&mut self.collection, lit, &meta)
            }
            "from_version" => {
                let version = parse_version(&meta)?;
                set_once(&mut self.from_version, version, &meta)
            }
            "to_version" => {
                let version = parse_version(&meta)?;
                set_once(&mut self.to_version, version, &meta)
            }
            "transform" => {
                let value = meta.value()?;
                let path = if value.peek(LitStr) {
                    value.parse::<LitStr>()?.parse::<ExprPath>()?
                } else {
                    value.parse::<ExprPath>()?
                };
                set_once(&mut self.transform, path, &meta)
            }
            _ => Err(meta.error(
                "unknown key; expected `collection`, `from_version`, `to_version` or `transform`",
            )),
        }
    }
}

fn set_once<T>(slot: &mut Option<T>, value: T, meta: &ParseNestedMeta<'_>) -> Result<()> {
    if slot.is_some() {
        return Err(meta.error("duplicate key"));
    }
    *slot = Some(value);
    Ok(())
}

// Schema versions start at 1; a record without the field is version 1.
fn parse_version(meta: &ParseNestedMeta<'_>) -> Result<(i32, Span)> {
    let lit: LitInt = meta.value()?.parse()?;
    let v = lit.base10_parse::<i32>()?;
    if v < 1 {
        return Err(Error::new(lit.span(), "schema versions start at 1"));
    }
    Ok((v, lit.span()))
}

fn expand(input: &DeriveInput) -> Result<proc_macro2::TokenStream> {
    match &input.data {
        Data::Struct(data) if matches!(data.fields, Fields::Unit) => {}
        _ => {
            return Err(Error::new_spanned(
                &input.ident,
                "#[derive(Upcaster)] expects a unit struct",
            ));
        }
    }

    let mut step = Step::default();
    for attr in input.attrs.iter().filter(|a| a.path().is_ident("upcaster")) {
        attr.parse_nested_meta(|meta| step.parse_entry(meta))?;
    }

    let missing = |key: &str| {
        Error::new_spanned(
            &input.ident,
            format!("#[upcaster(...)] is missing `{key}`"),
        )
    };
    let collection = step.collection.ok_or_else(|| missing("collection"))?;
    let (from_version, _) = step.from_version.ok_or_else(|| missing("from_version"))?;
    let transform = step.transform.ok_or_else(|| missing("transform"))?;
    let to_version = match step.to_version {
        Some((to, span)) if to <= from_version => {
            return Err(Error::new(
                span,
                format!("to_version must be greater than from_version ({from_version})"),
            ));
        }
        Some((to, _)) => to,
        None => from_version + 1,
    };

    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();
    Ok(quote! {
        impl #impl_generics ::fieldsync::upcasting::Upcaster for #name #ty_generics #where_clause {
            fn collection(&self) -> &str {
                #collection
            }

            fn from_version(&self) -> i32 {
                #from_version
            }

            fn to_version(&self) -> i32 {
                #to_version
            }

            fn upcast(&self, body: &::serde_json::Value) -> ::fieldsync::Result<::serde_json::Value> {
                #transform(body)
            }
        }
    })
}
