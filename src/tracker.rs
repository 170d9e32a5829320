//! Sync-completion tracker.

use std::collections::HashMap;

use crate::collection::LoadStatus;

/// True while any collection a view needs has not finished its first load.
///
/// `public` names are looked up as given; `user` names are looked up with
/// `group_id` appended (no separator). A name missing from `statuses`
/// counts as still loading.
///
/// ```
/// use mailround_sync::{is_still_loading, LoadStatus};
/// use std::collections::HashMap;
///
/// let mut statuses = HashMap::new();
/// statuses.insert("streetinfodb".to_string(), LoadStatus::Loaded);
/// statuses.insert("rounddb_g1".to_string(), LoadStatus::Loading);
///
/// assert!(is_still_loading(&["streetinfodb"], &["rounddb_"], "g1", &statuses));
/// statuses.insert("rounddb_g1".to_string(), LoadStatus::Loaded);
/// assert!(!is_still_loading(&["streetinfodb"], &["rounddb_"], "g1", &statuses));
/// ```
pub fn is_still_loading<P, U>(
    public: &[P],
    user: &[U],
    group_id: &str,
    statuses: &HashMap<String, LoadStatus>,
) -> bool
where
    P: AsRef<str>,
    U: AsRef<str>,
{
    let loaded = |name: &str| statuses.get(name).is_some_and(|status| status.is_loaded());

    public.iter().any(|name| !loaded(name.as_ref()))
        || user
            .iter()
            .any(|name| !loaded(&format!("{}{}", name.as_ref(), group_id)))
}
