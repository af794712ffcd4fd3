//! Derive macro for oxide-store entities.
//!
//! This crate provides `#[derive(Entity)]`, which maps a struct with named
//! fields to a table: one column per field, in declaration order.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, Attribute, Data, DeriveInput, Expr, Fields, Ident, Lit, Meta, Type};

/// Derives `Entity` (and `KeyedEntity` when a primary key is declared) for a
/// struct, and generates a typed field handle per field.
///
/// The struct must also implement `Clone` and `Default`.
///
/// # Struct Attributes
///
/// - `#[entity(table = "table_name")]` - SQL table name (optional, defaults
///   to snake_case of the struct name)
/// - `#[entity(index = "a, b")]` - Adds a multi-column index
/// - `#[entity(unique_index = "a, b")]` - Adds a multi-column unique index
///
/// # Field Attributes
///
/// - `#[field(primary_key)]` - Part of the primary key (at most two fields)
/// - `#[field(name = "column_name")]` - SQL column name (optional, defaults
///   to the field name)
/// - `#[field(index)]` - Single-column index
/// - `#[field(unique)]` - Single-column unique index
/// - `#[field(references = "table.column")]` - Foreign key
///
/// `Option<T>` fields map to nullable columns.
///
/// # Generated Items
///
/// For a field `age: i64` on `Person`, this macro generates
/// `Person::age() -> Field<Person, i64>`.
#[proc_macro_derive(Entity, attributes(entity, field))]
pub fn derive_entity(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    derive_entity_impl(input)
        .unwrap_or_else(|e| e.to_compile_error())
        .into()
}

fn derive_entity_impl(input: DeriveInput) -> syn::Result<TokenStream2> {
    let struct_name = &input.ident;
    let entity_attrs = parse_entity_attrs(&input.attrs, struct_name)?;

    let fields = match &input.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(fields) => &fields.named,
            _ => {
                return Err(syn::Error::new_spanned(
                    &input,
                    "Entity derive only supports structs with named fields",
                ));
            }
        },
        _ => {
            return Err(syn::Error::new_spanned(
                &input,
                "Entity derive only supports structs",
            ));
        }
    };

    let mut field_infos: Vec<FieldInfo> = Vec::new();
    for field in fields {
        let Some(field_name) = field.ident.clone() else {
            return Err(syn::Error::new_spanned(field, "expected a named field"));
        };
        let attrs = parse_field_attrs(&field.attrs)?;
        field_infos.push(FieldInfo {
            column_name: attrs.name.clone().unwrap_or_else(|| field_name.to_string()),
            field_name,
            field_type: field.ty.clone(),
            attrs,
        });
    }

    let key_fields: Vec<&FieldInfo> = field_infos.iter().filter(|f| f.attrs.primary_key).collect();
    if key_fields.len() > 2 {
        return Err(syn::Error::new_spanned(
            &input,
            "Entity derive supports primary keys of at most two fields",
        ));
    }

    let table_name = &entity_attrs.table;

    let field_defs: Vec<TokenStream2> = field_infos
        .iter()
        .map(|info| {
            let field_name = &info.field_name;
            let column_name = &info.column_name;
            quote! {
                ::oxide_store_core::FieldDef::new(
                    #column_name,
                    |row: &Self| &row.#field_name,
                    |row: &mut Self| &mut row.#field_name,
                )
            }
        })
        .collect();

    let key_columns: Vec<&str> = key_fields.iter().map(|f| f.column_name.as_str()).collect();

    let mut indexes: Vec<TokenStream2> = Vec::new();
    for info in &field_infos {
        let column_name = &info.column_name;
        if info.attrs.unique {
            indexes.push(quote! { ::oxide_store_core::TableIndex::unique([#column_name]) });
        } else if info.attrs.index {
            indexes.push(quote! { ::oxide_store_core::TableIndex::new([#column_name]) });
        }
    }
    for (columns, unique) in &entity_attrs.indexes {
        let constructor = if *unique {
            quote! { unique }
        } else {
            quote! { new }
        };
        indexes.push(quote! { ::oxide_store_core::TableIndex::#constructor([#(#columns),*]) });
    }

    let mut foreign_keys: Vec<TokenStream2> = Vec::new();
    for info in &field_infos {
        if let Some(target) = &info.attrs.references {
            let Some((table, column)) = target.split_once('.') else {
                return Err(syn::Error::new_spanned(
                    &info.field_name,
                    "references must have the form \"table.column\"",
                ));
            };
            let column_name = &info.column_name;
            foreign_keys.push(quote! {
                ::oxide_store_core::ForeignKey::new(#column_name, #table, #column)
            });
        }
    }

    let accessors: Vec<TokenStream2> = field_infos
        .iter()
        .map(|info| {
            let field_name = &info.field_name;
            let field_type = &info.field_type;
            let column_name = &info.column_name;
            quote! {
                /// Returns the typed field handle for queries.
                #[must_use]
                pub fn #field_name() -> ::oxide_store_core::Field<Self, #field_type> {
                    ::oxide_store_core::Field::new(#column_name, |row: &Self| &row.#field_name)
                }
            }
        })
        .collect();

    let keyed_impl = match key_fields.as_slice() {
        [] => quote! {},
        [single] => {
            let name = &single.field_name;
            let ty = &single.field_type;
            quote! {
                impl ::oxide_store_core::KeyedEntity for #struct_name {
                    type Key = #ty;

                    fn key(&self) -> Self::Key {
                        ::core::clone::Clone::clone(&self.#name)
                    }

                    fn set_key(&mut self, key: Self::Key) {
                        self.#name = key;
                    }
                }
            }
        }
        [first, second] => {
            let (a, b) = (&first.field_name, &second.field_name);
            let (ta, tb) = (&first.field_type, &second.field_type);
            quote! {
                impl ::oxide_store_core::KeyedEntity for #struct_name {
                    type Key = (#ta, #tb);

                    fn key(&self) -> Self::Key {
                        (
                            ::core::clone::Clone::clone(&self.#a),
                            ::core::clone::Clone::clone(&self.#b),
                        )
                    }

                    fn set_key(&mut self, key: Self::Key) {
                        self.#a = key.0;
                        self.#b = key.1;
                    }
                }
            }
        }
        _ => unreachable!("key length checked above"),
    };

    let expanded = quote! {
        impl ::oxide_store_core::Entity for #struct_name {
            const TABLE: &'static str = #table_name;

            fn fields() -> ::std::vec::Vec<::oxide_store_core::FieldDef<Self>> {
                ::std::vec![#(#field_defs),*]
            }

            fn primary_key() -> &'static [&'static str] {
                &[#(#key_columns),*]
            }

            fn indexes() -> ::std::vec::Vec<::oxide_store_core::TableIndex> {
                ::std::vec![#(#indexes),*]
            }

            fn foreign_keys() -> ::std::vec::Vec<::oxide_store_core::ForeignKey> {
                ::std::vec![#(#foreign_keys),*]
            }
        }

        #keyed_impl

        impl #struct_name {
            #(#accessors)*
        }
    };

    Ok(expanded)
}

struct FieldInfo {
    field_name: Ident,
    field_type: Type,
    column_name: String,
    attrs: FieldAttrs,
}

#[derive(Default)]
struct FieldAttrs {
    name: Option<String>,
    primary_key: bool,
    index: bool,
    unique: bool,
    references: Option<String>,
}

struct EntityAttrs {
    table: String,
    indexes: Vec<(Vec<String>, bool)>,
}

fn string_value(meta: &syn::meta::ParseNestedMeta<'_>) -> syn::Result<String> {
    let value: Expr = meta.value()?.parse()?;
    if let Expr::Lit(lit) = value {
        if let Lit::Str(s) = lit.lit {
            return Ok(s.value());
        }
    }
    Err(meta.error("expected a string literal"))
}

fn column_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect()
}

fn parse_entity_attrs(attrs: &[Attribute], struct_name: &Ident) -> syn::Result<EntityAttrs> {
    let mut result = EntityAttrs {
        table: to_snake_case(&struct_name.to_string()),
        indexes: Vec::new(),
    };
    for attr in attrs {
        if attr.path().is_ident("entity") {
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("table") {
                    result.table = string_value(&meta)?;
                } else if meta.path.is_ident("index") {
                    result.indexes.push((column_list(&string_value(&meta)?), false));
                } else if meta.path.is_ident("unique_index") {
                    result.indexes.push((column_list(&string_value(&meta)?), true));
                } else {
                    return Err(meta.error("unsupported entity attribute"));
                }
                Ok(())
            })?;
        }
    }
    Ok(result)
}

fn parse_field_attrs(attrs: &[Attribute]) -> syn::Result<FieldAttrs> {
    let mut result = FieldAttrs::default();

    for attr in attrs {
        if attr.path().is_ident("field") {
            // Handle empty attribute like #[field]
            if matches!(attr.meta, Meta::Path(_)) {
                continue;
            }

            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("primary_key") {
                    result.primary_key = true;
                } else if meta.path.is_ident("index") {
                    result.index = true;
                } else if meta.path.is_ident("unique") {
                    result.unique = true;
                } else if meta.path.is_ident("name") {
                    result.name = Some(string_value(&meta)?);
                } else if meta.path.is_ident("references") {
                    result.references = Some(string_value(&meta)?);
                } else {
                    return Err(meta.error("unsupported field attribute"));
                }
                Ok(())
            })?;
        }
    }

    Ok(result)
}

fn to_snake_case(s: &str) -> String {
    let mut result = String::new();
    for (i, c) in s.chars().enumerate() {
        if c.is_uppercase() {
            if i > 0 {
                result.push('_');
            }
            result.push(c.to_ascii_lowercase());
        } else {
            result.push(c);
        }
    }
    result
}
