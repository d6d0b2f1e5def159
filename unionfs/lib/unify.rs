use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use crate::{path, Entry, EntryKind, OPAQUE_MARKER, WHITEOUT_PREFIX};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Flattens a base-to-top list of layers into the final filesystem view.
///
/// Layers are walked from the top down. `finalized` tracks the status of
/// every path seen so far: `true` means the path is settled (a regular file,
/// symlink, special file or a whiteout tombstone) and lower layers may not
/// contribute to it or below it; `false` means an existing directory whose
/// interior stays open to lower-layer contributions. Opaque markers are
/// collected per layer and only merged into the cross-layer set once the
/// layer completes, so they hide lower layers but never their own siblings.
///
/// The output is sorted by cleaned name and contains no whiteout records; a
/// deleted directory disappears entirely while an opaque directory survives
/// with only its surviving contents.
pub fn unify(layers: &[&[Arc<Entry>]]) -> Vec<Arc<Entry>> {
    let mut finalized: HashMap<String, bool> = HashMap::new();
    let mut opaque: HashSet<String> = HashSet::new();
    let mut out: Vec<Arc<Entry>> = Vec::new();

    for layer in layers.iter().rev() {
        // Opaque markers found in this layer; applied to lower layers only.
        let mut layer_opaque: HashSet<String> = HashSet::new();

        for entry in layer.iter() {
            let name = path::clean(entry.get_name());
            let base = path::file_name(&name);
            let dir = path::parent(&name);

            if base == OPAQUE_MARKER {
                layer_opaque.insert(dir.to_string());
                continue;
            }

            let is_tombstone = base.starts_with(WHITEOUT_PREFIX);
            let real_path = if is_tombstone {
                path::join(dir, &base[WHITEOUT_PREFIX.len()..])
            } else {
                name.clone()
            };

            if finalized.contains_key(&real_path) {
                continue;
            }
            if under_finalized(&finalized, &real_path) || under_opaque(&opaque, &real_path) {
                continue;
            }

            finalized.insert(
                real_path,
                is_tombstone || entry.get_kind() != EntryKind::Directory,
            );

            if !is_tombstone {
                if name == *entry.get_name() {
                    out.push(Arc::clone(entry));
                } else {
                    let mut cleaned = entry.as_ref().clone();
                    cleaned.set_name(name);
                    out.push(Arc::new(cleaned));
                }
            }
        }

        opaque.extend(layer_opaque);
    }

    out.sort_by(|a, b| a.get_name().cmp(b.get_name()));
    out
}

/// Returns whether any ancestor of `path` has been settled at a
/// non-directory by a higher layer.
fn under_finalized(finalized: &HashMap<String, bool>, path: &str) -> bool {
    let mut current = path::parent(path);
    while !current.is_empty() {
        if finalized.get(current) == Some(&true) {
            return true;
        }
        current = path::parent(current);
    }
    false
}

/// Returns whether any ancestor of `path`, the root included, was made
/// opaque by a higher layer. The root entry itself is exempt: an opaque
/// marker at the top of a layer hides what lies beneath the root, never the
/// root.
fn under_opaque(opaque: &HashSet<String>, path: &str) -> bool {
    if path.is_empty() {
        return false;
    }
    let mut current = path::parent(path);
    loop {
        if opaque.contains(current) {
            return true;
        }
        if current.is_empty() {
            return false;
        }
        current = path::parent(current);
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
