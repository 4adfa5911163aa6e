// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Debian repository synchronization and publication.

This crate mirrors APT repositories into versioned local storage and republishes
stored content as repositories of its own.

# Goals

## Determinism and Reproducibility

Given the same repository version and publication options, generated metadata is
byte-for-byte identical. Only signatures, which embed a creation time, differ
between publications.

## Host Agnosticism

Persistence is consumed through the [storage::ArtifactStore] and
[storage::RepositoryStore] traits. Remote access is consumed through
[io::DataResolver]. Hosts supply their own implementations or use the in-memory
and filesystem ones provided here.

# A Tour of Functionality

Debian repository metadata consists of *control files*: paragraphs of key-value
fields. The [control] module implements them. [release] parses and renders the
`Release` and `InRelease` files at the root of a distribution. [package_index]
parses and renders the `Packages` and `Sources` indices they list.

A sync is driven by [sync::Syncer]. It fetches remote metadata, resolves the
remote package set with [resolver::resolve()], plans the delta against the latest
[content::RepositoryVersion] with [planner::plan()], downloads additions through
[download] and records the next version.

[publish::Publisher] turns a repository version into a [publish::Publication]:
an in-memory tree of generated metadata and references to stored package files.
[publish::Publication::write_to()] materializes it through a
[publish::writer::RepositoryWriter]. `Release` files can be signed with a
[signing::ReleaseSigner].

Operations are configured through the serde types in [config].

# Crate Features

The optional and enabled-by-default `http` feature enables HTTP support for
fetching remote repositories via [remote::http::HttpRepositoryClient].
*/

pub mod config;
pub mod content;
pub mod control;
pub mod download;
pub mod error;
pub mod io;
pub mod package_index;
pub mod planner;
pub mod publish;
pub mod release;
pub mod remote;
pub mod resolver;
pub mod signing;
pub mod storage;
pub mod sync;
