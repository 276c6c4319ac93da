// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Publishing and verifying signed Debian package archives.

A Debian archive is a tree of signed metadata. `dists/<suite>/InRelease` declares
the digests of the `Packages` and `Sources` indices, whose entries declare the
digests of files in `pool/`. This crate writes such trees and reads them back
without trusting a byte that isn't covered by that chain.

# Publishing

Files enter the content addressed [store] through the [pool::Pool]. The resulting
[package::Package] and [source::Source] entries are accumulated in a
[suite::Suite], which streams them into every configured compression variant of
each index while hashing. [publisher::Publisher] then commits the indices plus a
signed `Release` and swaps paths over in an order that never exposes a `Release`
referencing missing indices.

# Reading

[archive::Archive] verifies `InRelease` against a [signing::Keyring] and hands
out index entries only after their digests matched. [downloader::Downloader]
does the same for mirrors, bounded in concurrency and retrying transient
failures. [version_map] groups entries by name and version for resolving
relationships.

Lower level pieces are control paragraphs in [control], version ordering in
[package_version] and digests in [hash].
*/

pub mod archive;
pub mod control;
pub mod deb;
pub mod dependency;
pub mod downloader;
pub mod error;
pub mod hash;
pub mod io;
pub mod package;
pub mod package_version;
pub mod path_reader;
pub mod pool;
pub mod publisher;
pub mod release;
pub mod signing;
pub mod source;
pub mod store;
pub mod suite;
pub mod version_map;
