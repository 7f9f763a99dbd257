use std::path::Path;

use dns_audit::util::names::{is_arpa, is_domain_name};
use dns_audit::DomainTask;

/// Read a list of domains from a file.  See `parse_list`.
pub async fn read_list(path: &Path) -> std::io::Result<Vec<String>> {
    let contents = tokio::fs::read_to_string(path).await?;
    Ok(parse_list(&contents))
}

/// One domain per line.  Everything after a `#` is a comment, and
/// blank lines are skipped.
pub fn parse_list(contents: &str) -> Vec<String> {
    contents
        .lines()
        .filter_map(|line| {
            let line = line.split('#').next().unwrap_or_default().trim().to_lowercase();
            if line.is_empty() {
                None
            } else {
                Some(line)
            }
        })
        .collect()
}

/// Turn candidate names into tasks, skipping anything which is not a
/// domain name and anything under `arpa`.
pub fn to_tasks(names: impl IntoIterator<Item = String>) -> Vec<DomainTask> {
    names
        .into_iter()
        .filter_map(|name| {
            let name = name.to_lowercase();
            if !is_domain_name(&name) {
                tracing::warn!(%name, "not a DNS name, skipping");
                return None;
            }

            let name = name.trim_end_matches('.');
            if is_arpa(name) {
                tracing::debug!(%name, "arpa name, skipping");
                return None;
            }

            Some(DomainTask::new(name))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(tasks: &[DomainTask]) -> Vec<&str> {
        tasks.iter().map(|task| task.name.as_str()).collect()
    }

    #[test]
    fn parse_list_strips_comments_and_blanks() {
        let contents =
            "# top domains\nExample.com\n\n   www.example.net   # trailing\n#\n\t\nfoo.org";

        assert_eq!(
            vec!["example.com", "www.example.net", "foo.org"],
            parse_list(contents)
        );
    }

    #[test]
    fn to_tasks_normalises() {
        let tasks = to_tasks(vec![
            "WWW.Example.COM.".to_string(),
            "example.net".to_string(),
        ]);

        assert_eq!(vec!["www.example.com", "example.net"], names(&tasks));
    }

    #[test]
    fn to_tasks_skips_invalid_names() {
        let tasks = to_tasks(vec![
            "not a domain".to_string(),
            "double..dot.com".to_string(),
            String::new(),
            "ok.com".to_string(),
        ]);

        assert_eq!(vec!["ok.com"], names(&tasks));
    }

    #[test]
    fn to_tasks_skips_arpa() {
        let tasks = to_tasks(vec![
            "1.0.0.127.in-addr.arpa".to_string(),
            "arpa.".to_string(),
            "arpa.example.com".to_string(),
        ]);

        assert_eq!(vec!["arpa.example.com"], names(&tasks));
    }

    #[tokio::test]
    async fn read_list_from_file() {
        let path = std::env::temp_dir().join(format!("lamedns-list-{}.txt", std::process::id()));
        tokio::fs::write(&path, "a.com\n# b.com\nc.com # c\n").await.unwrap();

        let list = read_list(&path).await;
        tokio::fs::remove_file(&path).await.unwrap();

        assert_eq!(vec!["a.com", "c.com"], list.unwrap());
    }

    #[tokio::test]
    async fn read_list_missing_file_errors() {
        assert!(read_list(Path::new("/nonexistent/lamedns/list.txt")).await.is_err());
    }
}
