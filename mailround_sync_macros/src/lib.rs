mod document;

use proc_macro::TokenStream;

// ============================================================================
// #[derive(Document)] derive macro
// ============================================================================

/// Derive macro for the `Document` trait.
///
/// # Usage
///
/// ```ignore
/// #[derive(Clone, PartialEq, Serialize, Deserialize, Document)]
/// #[document(collection = "sortboxdb_", group_scoped, guards_unassigned)]
/// struct SortBoxItem {
///     #[serde(rename = "_id")]
///     #[document(id)]
///     pub id: String,
///     pub name: String,
/// }
/// ```
///
/// - `#[document(collection = "...")]` sets the base collection name.
///   If omitted, defaults to the snake_case struct name + "db".
/// - `group_scoped` makes the concrete name `collection + group id`.
/// - `guards_unassigned` reserves id `"0"` as the unassigned sentinel.
/// - `#[document(id)]` marks the `String` field holding the identifier.
///   If omitted, defaults to a field named `id`.
#[proc_macro_derive(Document, attributes(document))]
pub fn derive_document(input: TokenStream) -> TokenStream {
    document::derive_document(input)
}
