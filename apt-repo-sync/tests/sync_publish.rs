// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Sync from a repository on disk, publish the result and sync it back.

use {
    apt_repo_sync::{
        config::RemoteConfig,
        error::Result,
        io::{compress_bytes, ChecksumType, Compression, DigestSet},
        publish::{writer::FilesystemRepositoryWriter, PublishMode, PublishOptions, Publisher},
        release::{parse_release, render_release, ReleaseDescriptor},
        remote::{filesystem::FilesystemRepositoryReader, reader_from_str},
        storage::{
            filesystem::{FilesystemArtifactStore, FilesystemRepositoryStore},
            RepositoryStore,
        },
        sync::Syncer,
    },
    std::path::Path,
};

fn write(root: &Path, path: &str, data: &[u8]) -> std::io::Result<()> {
    let path = root.join(path);
    std::fs::create_dir_all(path.parent().unwrap())?;
    std::fs::write(path, data)
}

/// Lay out a small distribution with two binary packages and one source package.
async fn create_remote(root: &Path) -> Result<()> {
    let mut packages = String::new();

    for (name, arch) in [("hello", "amd64"), ("hello-doc", "all")] {
        let filename = format!("pool/main/h/hello/{}_2.10-1_{}.deb", name, arch);
        let data = format!("{} deb", name).into_bytes();
        write(root, &filename, &data)?;

        packages.push_str(&format!(
            "Package: {}\nSource: hello\nVersion: 2.10-1\nArchitecture: {}\nMaintainer: Example <hello@example.com>\nFilename: {}\nSize: {}\nMD5sum: {}\nSHA256: {}\nDescription: greeting\n example package\n\n",
            name,
            arch,
            filename,
            data.len(),
            ChecksumType::Md5.digest_data(&data).digest_hex(),
            ChecksumType::Sha256.digest_data(&data).digest_hex(),
        ));
    }

    let dsc = b"dsc content".to_vec();
    let tarball = b"tarball content".to_vec();
    write(root, "pool/main/h/hello/hello_2.10-1.dsc", &dsc)?;
    write(root, "pool/main/h/hello/hello_2.10.orig.tar.gz", &tarball)?;

    let mut sources = String::from("Package: hello\nVersion: 2.10-1\nDirectory: pool/main/h/hello\n");
    for checksum in [ChecksumType::Md5, ChecksumType::Sha256] {
        sources.push_str(&format!("{}:\n", checksum.sources_field_name()));
        for (filename, data) in [
            ("hello_2.10-1.dsc", &dsc),
            ("hello_2.10.orig.tar.gz", &tarball),
        ] {
            sources.push_str(&format!(
                " {} {} {}\n",
                checksum.digest_data(data).digest_hex(),
                data.len(),
                filename
            ));
        }
    }

    let mut release = ReleaseDescriptor {
        origin: Some("Example".into()),
        suite: Some("stable".into()),
        codename: Some("bookworm".into()),
        components: vec!["main".into()],
        architectures: vec!["amd64".into()],
        ..Default::default()
    };

    let packages_gz = compress_bytes(packages.as_bytes(), Compression::Gzip).await?;
    for (path, data) in [
        ("main/binary-amd64/Packages", packages.as_bytes().to_vec()),
        ("main/binary-amd64/Packages.gz", packages_gz),
        ("main/source/Sources", sources.into_bytes()),
    ] {
        write(root, &format!("dists/bookworm/{}", path), &data)?;
        release.add_entry(path, data.len() as u64, DigestSet::digest_data(&data));
    }

    write(root, "dists/bookworm/Release", &render_release(&release))?;

    Ok(())
}

#[tokio::test]
async fn sync_publish_resync() -> Result<()> {
    let td = tempfile::tempdir()?;
    let upstream = td.path().join("upstream");
    let published = td.path().join("published");
    create_remote(&upstream).await?;

    let artifacts = FilesystemArtifactStore::new(td.path().join("artifacts"));
    let repositories = FilesystemRepositoryStore::new(td.path().join("versions"));

    let reader = FilesystemRepositoryReader::new(&upstream);
    let mut config = RemoteConfig::new("example", "unused", "bookworm");
    config.sync_sources = true;

    let version = Syncer::new(&reader, &artifacts, &repositories)
        .sync(&config)
        .await?;
    assert_eq!(version.number, 1);
    assert_eq!(version.units.len(), 3);
    assert_eq!(
        repositories.latest_version("example").await?,
        Some(version.clone())
    );

    let options = PublishOptions {
        mode: PublishMode::Structured,
        distribution: "stable".into(),
        components: vec!["main".into()],
        architectures: vec!["amd64".into()],
        origin: Some("Republished".into()),
        ..Default::default()
    };
    let publication = Publisher::new(&artifacts).publish(&version, &options).await?;

    let writer = FilesystemRepositoryWriter::new(&published);
    publication.write_to(&writer, &artifacts, 4, &None).await?;

    assert_eq!(
        std::fs::read(published.join("pool/main/h/hello/hello_2.10-1_amd64.deb"))?,
        b"hello deb"
    );
    assert_eq!(
        std::fs::read(published.join("pool/main/h/hello/hello_2.10.orig.tar.gz"))?,
        b"tarball content"
    );

    let release = parse_release(&std::fs::read(published.join("dists/stable/Release"))?)?;
    assert_eq!(release.origin.as_deref(), Some("Republished"));
    assert!(release.entries.contains_key("main/binary-amd64/Packages.xz"));

    // The published repository is itself a valid remote.
    let reader = reader_from_str(&format!("file://{}", published.display()))?;
    let mut config = RemoteConfig::new("copy", "unused", "stable");
    config.sync_sources = true;

    let copy = Syncer::new(&*reader, &artifacts, &repositories)
        .sync(&config)
        .await?;
    assert_eq!(copy.keys(), version.keys());

    Ok(())
}

#[tokio::test]
async fn mirror_verbatim() -> Result<()> {
    let td = tempfile::tempdir()?;
    let upstream = td.path().join("upstream");
    let published = td.path().join("published");
    create_remote(&upstream).await?;

    let artifacts = FilesystemArtifactStore::new(td.path().join("artifacts"));
    let repositories = FilesystemRepositoryStore::new(td.path().join("versions"));

    let reader = FilesystemRepositoryReader::new(&upstream);
    let mut config = RemoteConfig::new("mirror", "unused", "bookworm");
    config.mirror = true;

    let version = Syncer::new(&reader, &artifacts, &repositories)
        .sync(&config)
        .await?;

    let publication = Publisher::new(&artifacts)
        .publish(
            &version,
            &PublishOptions {
                mode: PublishMode::Verbatim,
                ..Default::default()
            },
        )
        .await?;
    assert_eq!(publication.distribution_path, "dists/bookworm");

    let writer = FilesystemRepositoryWriter::new(&published);
    publication.write_to(&writer, &artifacts, 4, &None).await?;

    for path in [
        "dists/bookworm/Release",
        "dists/bookworm/main/binary-amd64/Packages.gz",
        "pool/main/h/hello/hello-doc_2.10-1_all.deb",
    ] {
        assert_eq!(
            std::fs::read(published.join(path))?,
            std::fs::read(upstream.join(path))?,
            "{} is identical",
            path
        );
    }

    // Every file the published Release lists is served, whichever variant the sync
    // read its package list from.
    let release = parse_release(&std::fs::read(published.join("dists/bookworm/Release"))?)?;
    assert_eq!(release.entries.len(), 3);
    for entry in release.entries.values() {
        let path = format!("dists/bookworm/{}", entry.path);
        assert_eq!(
            std::fs::read(published.join(&path))?,
            std::fs::read(upstream.join(&path))?,
            "{} is identical",
            path
        );
    }
    assert!(version.origin.absent_metadata.is_empty());

    Ok(())
}
