use proc_macro::TokenStream;
use quote::quote;
use syn::{Data, DeriveInput, Fields, LitStr};

#[derive(Default)]
struct Options {
    collection: Option<String>,
    group_scoped: bool,
    guards_unassigned: bool,
}

pub fn derive_document(input: TokenStream) -> TokenStream {
    let input = syn::parse_macro_input!(input as DeriveInput);

    match expand(&input) {
        Ok(tokens) => TokenStream::from(tokens),
        Err(err) => TokenStream::from(err.to_compile_error()),
    }
}

fn expand(input: &DeriveInput) -> syn::Result<proc_macro2::TokenStream> {
    let name = &input.ident;
    let options = parse_options(input)?;
    let id_field = extract_id_field(input)?;

    let collection = options
        .collection
        .unwrap_or_else(|| format!("{}db", to_snake_case(&name.to_string())));
    let group_scoped = options.group_scoped;
    let guards_unassigned = options.guards_unassigned;

    Ok(quote! {
        impl mailround_sync::Document for #name {
            const COLLECTION: &'static str = #collection;
            const GROUP_SCOPED: bool = #group_scoped;
            const GUARDS_UNASSIGNED: bool = #guards_unassigned;

            fn id(&self) -> &str {
                &self.#id_field
            }
        }
    })
}

fn parse_options(input: &DeriveInput) -> syn::Result<Options> {
    let mut options = Options::default();

    for attr in &input.attrs {
        if !attr.path().is_ident("document") {
            continue;
        }

        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("collection") {
                let value: LitStr = meta.value()?.parse()?;
                options.collection = Some(value.value());
            } else if meta.path.is_ident("group_scoped") {
                options.group_scoped = true;
            } else if meta.path.is_ident("guards_unassigned") {
                options.guards_unassigned = true;
            } else {
                return Err(meta.error("expected `collection`, `group_scoped` or `guards_unassigned`"));
            }
            Ok(())
        })?;
    }

    Ok(options)
}

fn extract_id_field(input: &DeriveInput) -> syn::Result<syn::Ident> {
    let Data::Struct(data_struct) = &input.data else {
        return Err(syn::Error::new_spanned(
            &input.ident,
            "Document can only be derived for structs",
        ));
    };
    let Fields::Named(fields) = &data_struct.fields else {
        return Err(syn::Error::new_spanned(
            &input.ident,
            "Document derive needs named fields",
        ));
    };

    for field in &fields.named {
        for attr in &field.attrs {
            if !attr.path().is_ident("document") {
                continue;
            }
            let mut is_id = false;
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("id") {
                    is_id = true;
                    Ok(())
                } else {
                    Err(meta.error("expected `id`"))
                }
            })?;
            if is_id {
                if let Some(ident) = &field.ident {
                    return Ok(ident.clone());
                }
            }
        }
    }

    fields
        .named
        .iter()
        .filter_map(|field| field.ident.as_ref())
        .find(|ident| *ident == "id")
        .cloned()
        .ok_or_else(|| {
            syn::Error::new_spanned(
                &input.ident,
                "Document derive: no field marked with #[document(id)] and no field named `id`",
            )
        })
}

fn to_snake_case(s: &str) -> String {
    let mut result = String::new();
    for (i, ch) in s.chars().enumerate() {
        if ch.is_uppercase() {
            if i > 0 {
                result.push('_');
            }
            result.extend(ch.to_lowercase());
        } else {
            result.push(ch);
        }
    }
    result
}
