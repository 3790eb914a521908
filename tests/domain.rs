use assert_matches::assert_matches;

use kira_genome_registry::domain::{AssetRef, DEFAULT_TAG, RelativeRef, TagName};
use kira_genome_registry::error::RegistryError;

#[test]
fn parse_registry_path_with_every_part() {
    let reference: AssetRef = "hg38/bowtie2_index.index:v1.0".parse().unwrap();
    assert_eq!(reference.collection.as_deref(), Some("hg38"));
    assert_eq!(reference.asset, "bowtie2_index");
    assert_eq!(reference.seek_key.as_deref(), Some("index"));
    assert_eq!(reference.tag.as_deref(), Some("v1.0"));
    assert_eq!(reference.to_string(), "hg38/bowtie2_index.index:v1.0");
}

#[test]
fn parse_registry_path_invalid() {
    for raw in ["", "hg38/", "a/b/c", "hg38/fasta:", "hg38/fa sta"] {
        assert_matches!(
            raw.parse::<AssetRef>(),
            Err(RegistryError::InvalidRegistryPath(_)),
            "{raw}"
        );
    }
}

#[test]
fn tag_names() {
    let tag: TagName = DEFAULT_TAG.parse().unwrap();
    assert_eq!(tag.as_str(), "default");
    assert_matches!("..".parse::<TagName>(), Err(RegistryError::InvalidTagName(_)));
    assert_matches!("v1/2".parse::<TagName>(), Err(RegistryError::InvalidTagName(_)));
}

#[test]
fn relative_refs_need_collection_and_tag() {
    let node: RelativeRef = "d1/fasta:default".parse().unwrap();
    assert_eq!(node, RelativeRef::new("d1", "fasta", "default"));
    assert!("fasta:default".parse::<RelativeRef>().is_err());
    assert!("d1/fasta".parse::<RelativeRef>().is_err());

    let short = RelativeRef::parse_in("fasta:default", "d1").unwrap();
    assert_eq!(short.to_string(), "d1/fasta:default");
}
