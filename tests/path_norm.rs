use cluster_filestate::path;

#[test]
fn directory_part_is_uppercased_file_name_preserved() {
    assert_eq!(path::normalize("\\share\\docs\\Report.txt", true), "\\SHARE\\DOCS\\Report.txt");
    assert_eq!(path::normalize("C:\\temp\\file.DAT", true), "C:\\TEMP\\file.DAT");
}

#[test]
fn whole_path_uppercased_when_case_insensitive() {
    assert_eq!(path::normalize("\\share\\docs\\Report.txt", false), "\\SHARE\\DOCS\\REPORT.TXT");
}

#[test]
fn path_without_separator_is_left_alone_when_case_sensitive() {
    assert_eq!(path::normalize("readme.md", true), "readme.md");
    assert_eq!(path::normalize("readme.md", false), "README.MD");
}

#[test]
fn forward_slashes_count_as_separators() {
    assert_eq!(path::normalize("/export/home/File.txt", true), "/EXPORT/HOME/File.txt");
}

#[test]
fn non_ascii_characters_are_preserved() {
    assert_eq!(path::normalize("\\straße\\Grüße.txt", true), "\\STRAßE\\Grüße.txt");
}

#[test]
fn normalization_is_idempotent() {
    let samples = [
        "\\share\\docs\\Report.txt",
        "C:\\temp\\file.DAT",
        "readme.md",
        "/export/home/File.txt",
        "\\UPPER\\ALREADY.TXT",
        "",
    ];
    for sample in samples {
        for case_sensitive in [true, false] {
            let once = path::normalize(sample, case_sensitive);
            let twice = path::normalize(&once, case_sensitive);
            assert_eq!(once, twice, "normalize must be idempotent for {sample:?}");
        }
    }
}

#[test]
fn folder_prefix_matches_whole_components_only() {
    assert!(path::is_under_folder("\\FOO\\A.TXT", "\\FOO"));
    assert!(path::is_under_folder("\\FOO\\BAR\\B.TXT", "\\FOO"));
    assert!(!path::is_under_folder("\\FOOD.TXT", "\\FOO"));
    assert!(!path::is_under_folder("\\FOO", "\\FOO"));
    assert!(!path::is_under_folder("\\BAR\\FOO\\A.TXT", "\\FOO"));
}

#[test]
fn rebase_moves_the_tail_under_the_new_prefix() {
    assert_eq!(
        path::rebase("\\FOO\\BAR\\B.TXT", "\\FOO", "\\BAZ"),
        Some("\\BAZ\\BAR\\B.TXT".to_string())
    );
    assert_eq!(path::rebase("\\FOOD.TXT", "\\FOO", "\\BAZ"), None);
}
