// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Resolution of the remote package set. */

use {
    crate::package_index::{PackageIndexEntry, PackageKey},
    std::collections::BTreeMap,
};

/// Deduplicate index entries by natural key.
///
/// When several entries share a key the one seen last wins. Callers control
/// priority by the order they feed components in. Entries are never merged.
pub fn resolve(
    entries: impl IntoIterator<Item = PackageIndexEntry>,
) -> BTreeMap<PackageKey, PackageIndexEntry> {
    let mut resolved = BTreeMap::new();

    for entry in entries {
        if let Some(previous) = resolved.insert(entry.key.clone(), entry) {
            log::debug!(
                "{} from component {} overridden by a later index",
                previous.key,
                previous.component
            );
        }
    }

    resolved
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::{
            error::Result,
            package_index::{parse_package_index, IndexFormat},
        },
        indoc::indoc,
    };

    #[test]
    fn later_entry_wins() -> Result<()> {
        let main = parse_package_index(
            indoc! {"
                Package: foo
                Version: 1.0
                Architecture: amd64
                Filename: pool/main/f/foo/foo_1.0_amd64.deb
                Size: 10
                SHA256: 00

                Package: bar
                Version: 1.0
                Architecture: amd64
                Filename: pool/main/b/bar/bar_1.0_amd64.deb
                Size: 10
                SHA256: 01
            "}
            .as_bytes(),
            IndexFormat::Packages,
        )?
        .into_iter()
        .map(|e| e.with_component("main"));

        let updates = parse_package_index(
            indoc! {"
                Package: foo
                Version: 1.0
                Architecture: amd64
                Filename: pool/updates/f/foo/foo_1.0_amd64.deb
                Size: 20
                SHA256: 02
            "}
            .as_bytes(),
            IndexFormat::Packages,
        )?
        .into_iter()
        .map(|e| e.with_component("updates"));

        let resolved = resolve(main.chain(updates));
        assert_eq!(resolved.len(), 2);

        let foo = &resolved[&PackageKey::new("foo", "1.0", "amd64")];
        assert_eq!(foo.component, "updates");
        assert_eq!(foo.artifacts[0].size, 20);
        assert_eq!(foo.artifacts[0].path, "pool/updates/f/foo/foo_1.0_amd64.deb");

        Ok(())
    }

    #[test]
    fn empty_input() {
        assert!(resolve(vec![]).is_empty());
    }
}
