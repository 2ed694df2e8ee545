//! Plain-text rendering of configuration, trees and counters.

use std::io::{self, Write};

use oima_core::{Catalog, Config, Stats};

/// Print the effective configuration. Secrets are reported as set or unset,
/// never printed.
pub fn print_config(out: &mut impl Write, config: &Config, password_set: bool) -> io::Result<()> {
    writeln!(out, "Configuration: {}", config.config_path.display())?;
    writeln!(out)?;
    writeln!(out, "Registry")?;
    writeln!(out, "  URI:            {}", config.registry.uri)?;
    writeln!(out, "  Requires auth:  {}", yes_no(config.registry.require_auth))?;
    if config.registry.require_auth {
        writeln!(out, "  Username:       {}", config.registry.username)?;
        writeln!(out, "  Password set:   {}", yes_no(password_set))?;
    }
    writeln!(out, "  Concurrency:    {}", config.registry.max_concurrency)?;
    writeln!(out)?;
    writeln!(out, "Signature storage (S3)")?;
    writeln!(out, "  Enabled:        {}", yes_no(config.s3.enabled))?;
    if config.s3.enabled {
        writeln!(out, "  Endpoint:       {}", config.s3.endpoint_url())?;
        writeln!(out, "  Region:         {}", config.s3.region)?;
        writeln!(out, "  Bucket:         {}", config.s3.bucket_name)?;
    }
    Ok(())
}

/// Print every repository, image and tag.
///
/// The signature column is shown only when signatures were looked up.
pub fn print_tree(out: &mut impl Write, catalog: &Catalog, signatures: bool) -> io::Result<()> {
    if catalog.is_empty() {
        writeln!(out, "No repositories found.")?;
        return Ok(());
    }

    for repository in catalog.repositories() {
        let count = repository.image_ids().len();
        writeln!(
            out,
            "{} ({} {})",
            repository.name(),
            count,
            if count == 1 { "image" } else { "images" }
        )?;

        for image in catalog.images_of(repository) {
            writeln!(out, "  {}", image.name())?;
            for tag in image.tags() {
                write!(out, "    {:<20} {}", tag.name, tag.content_digest)?;
                if signatures {
                    let status = if tag.signature_found { "signed" } else { "unsigned" };
                    write!(out, "  [{}]", status)?;
                }
                writeln!(out)?;
            }
        }
    }
    Ok(())
}

pub fn print_stats(out: &mut impl Write, stats: &Stats) -> io::Result<()> {
    writeln!(out, "Repositories:  {}", stats.repositories)?;
    writeln!(out, "Images:        {}", stats.images)?;
    writeln!(out, "Tags:          {}", stats.tags)?;
    writeln!(out, "Signatures:    {}", stats.signatures)?;
    Ok(())
}

fn yes_no(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oima_core::{RegistryConfig, Tag};

    fn render<F>(f: F) -> String
    where
        F: FnOnce(&mut Vec<u8>) -> io::Result<()>,
    {
        let mut buf = Vec::new();
        f(&mut buf).unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn test_print_config_hides_password() {
        let mut config = Config::new(
            RegistryConfig::new("https://registry.example.com").with_auth("robot"),
        );
        config.registry.password = Some("hunter2".to_string());

        let text = render(|out| print_config(out, &config, true));
        assert!(text.contains("https://registry.example.com"));
        assert!(text.contains("robot"));
        assert!(text.contains("Password set:   yes"));
        assert!(!text.contains("hunter2"));
    }

    #[test]
    fn test_print_tree() {
        let mut catalog = Catalog::new();
        let root = catalog.insert_repository("/");
        let nginx = catalog.insert_image(root, "nginx");
        let mut tag = Tag::new("latest", "sha256:abc");
        tag.signature_found = true;
        catalog.image_mut(nginx).set_tags(vec![tag]);

        let text = render(|out| print_tree(out, &catalog, true));
        assert!(text.starts_with("/ (1 image)\n  nginx\n"));
        assert!(text.contains("sha256:abc  [signed]"));

        let text = render(|out| print_tree(out, &catalog, false));
        assert!(!text.contains("signed"));
    }

    #[test]
    fn test_print_empty_tree() {
        let text = render(|out| print_tree(out, &Catalog::new(), false));
        assert_eq!(text, "No repositories found.\n");
    }

    #[test]
    fn test_print_stats() {
        let stats = Stats {
            repositories: 3,
            images: 3,
            tags: 4,
            signatures: 1,
        };
        let text = render(|out| print_stats(out, &stats));
        assert!(text.contains("Repositories:  3"));
        assert!(text.contains("Signatures:    1"));
    }
}
