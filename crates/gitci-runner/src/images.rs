//! Container image resolution for jobs.

use gitci_core::pipeline::Job;

/// Image used when a job's labels resolve to nothing.
pub const DEFAULT_IMAGE: &str = "ubuntu:22.04";

/// Exact `runs_on` labels and their images.
const IMAGE_TABLE: &[(&str, &str)] = &[
    ("ubuntu-24.04", "ubuntu:24.04"),
    ("ubuntu-22.04", "ubuntu:22.04"),
    ("ubuntu-20.04", "ubuntu:20.04"),
    ("ubuntu-latest", "ubuntu:latest"),
    ("debian-12", "debian:12"),
    ("debian-11", "debian:11"),
    ("alpine-3.19", "alpine:3.19"),
    ("alpine-3.18", "alpine:3.18"),
    ("node-23", "node:23"),
    ("node-22", "node:22"),
    ("node-20", "node:20"),
    ("node-18", "node:18-slim"),
    ("python-3.14", "python:3.14-slim"),
    ("python-3.13", "python:3.13-slim"),
    ("python-3.12", "python:3.12-slim"),
    ("python-3.11", "python:3.11-slim"),
    ("golang-1.23", "golang:1.23-alpine"),
    ("golang-1.22", "golang:1.22-alpine"),
    ("golang-1.20", "golang:1.20-alpine"),
];

/// Fallbacks for labels containing a known distribution or toolchain.
const IMAGE_PATTERNS: &[(&str, &str)] = &[
    ("ubuntu", "ubuntu:22.04"),
    ("debian", "debian:latest"),
    ("alpine", "alpine:latest"),
    ("node", "node:lts-slim"),
    ("python", "python:3-slim"),
    ("golang", "golang:alpine"),
];

/// Pick the image a job runs in.
///
/// `container.image` wins, then `image`, then the `runs_on` label looked up
/// case-insensitively in the table, then by pattern, then `default`.
pub fn resolve_image(job: &Job, default: &str) -> String {
    if let Some(image) = job
        .container
        .as_ref()
        .map(|c| c.image.as_str())
        .filter(|i| !i.is_empty())
    {
        return image.to_string();
    }
    if let Some(image) = job.image.as_deref().filter(|i| !i.is_empty()) {
        return image.to_string();
    }

    let label = job.runs_on.as_deref().unwrap_or_default().to_lowercase();
    image_for_label(&label).unwrap_or(default).to_string()
}

fn image_for_label(label: &str) -> Option<&'static str> {
    if label.is_empty() {
        return None;
    }
    if let Some((_, image)) = IMAGE_TABLE.iter().find(|(l, _)| *l == label) {
        return Some(image);
    }
    if let Some((_, image)) = IMAGE_PATTERNS.iter().find(|(p, _)| label.contains(p)) {
        return Some(image);
    }
    // `go` on its own is too short to match as a substring.
    label
        .split(|c: char| !c.is_ascii_alphanumeric())
        .any(|token| token == "go")
        .then_some("golang:alpine")
}

#[cfg(test)]
mod tests {
    use super::*;
    use gitci_core::pipeline::ContainerSpec;

    fn job_on(label: &str) -> Job {
        let mut job = Job::new("build");
        job.runs_on = Some(label.to_string());
        job
    }

    #[test]
    fn test_table_lookup() {
        assert_eq!(resolve_image(&job_on("ubuntu-22.04"), DEFAULT_IMAGE), "ubuntu:22.04");
        assert_eq!(resolve_image(&job_on("Node-18"), DEFAULT_IMAGE), "node:18-slim");
        assert_eq!(
            resolve_image(&job_on("golang-1.22"), DEFAULT_IMAGE),
            "golang:1.22-alpine"
        );
    }

    #[test]
    fn test_pattern_fallbacks() {
        assert_eq!(resolve_image(&job_on("self-hosted-debian"), DEFAULT_IMAGE), "debian:latest");
        assert_eq!(resolve_image(&job_on("python-3.9"), DEFAULT_IMAGE), "python:3-slim");
        assert_eq!(resolve_image(&job_on("go-1.21"), DEFAULT_IMAGE), "golang:alpine");
        assert_eq!(resolve_image(&job_on("ubuntu-18.04"), DEFAULT_IMAGE), "ubuntu:22.04");
    }

    #[test]
    fn test_unknown_label_uses_default() {
        assert_eq!(resolve_image(&job_on("unknown-thing"), DEFAULT_IMAGE), DEFAULT_IMAGE);
        assert_eq!(resolve_image(&job_on("windows-latest"), "busybox"), "busybox");
        assert_eq!(resolve_image(&Job::new("plain"), "busybox"), "busybox");
    }

    #[test]
    fn test_explicit_images_win() {
        let mut job = job_on("ubuntu-22.04");
        job.image = Some("rust:1.80".to_string());
        assert_eq!(resolve_image(&job, DEFAULT_IMAGE), "rust:1.80");

        job.container = Some(ContainerSpec {
            image: "alpine:3.19".to_string(),
            ..Default::default()
        });
        assert_eq!(resolve_image(&job, DEFAULT_IMAGE), "alpine:3.19");
    }
}
