use super::*;
use crate::render::{PassthroughRenderer, RenderError};
use tempfile::tempdir;

fn extract_text(text: &str) -> Result<FileExtraction, ExtractError> {
    let extractor = MarkdownExtractor::new("/vault");
    let source = SourceFile {
        key: "Uni/test.md".to_string(),
        absolute: PathBuf::from("/vault/Uni/test.md"),
    };
    extractor.extract(&source, text.as_bytes(), &PassthroughRenderer)
}

struct FailingRenderer;

impl RenderService for FailingRenderer {
    fn render(&self, _request: &RenderRequest<'_>) -> Result<Rendered, RenderError> {
        Err(RenderError::NotUtf8 {
            tool: "typst".to_string(),
        })
    }
}

const SCENARIO: &str = "#test #testing\n\
# Definition\n\
The ==derivative== is the limit of the difference quotient.\n\
# Formula\n\
==Area== of a circle: $\\pi r^2$\n";

#[test]
fn scenario_file_yields_two_cards_with_context_and_tags() {
    let extraction = extract_text(SCENARIO).unwrap();

    assert_eq!(extraction.path, "Uni/test.md");
    assert_eq!(
        extraction.tags,
        BTreeSet::from(["test".to_string(), "testing".to_string()])
    );
    assert_eq!(extraction.units.len(), 2);

    let first = &extraction.units[0];
    assert_eq!(first.position, 0);
    assert_eq!(
        first.content,
        "The {{c1::derivative}} is the limit of the difference quotient."
    );
    assert_eq!(first.context, "Uni > test > Definition");
    assert_eq!(first.tags, extraction.tags);
    assert!(first.anchor.marker.is_none());

    let second = &extraction.units[1];
    assert_eq!(second.position, 1);
    assert_eq!(second.content, "{{c1::Area}} of a circle: \\(\\pi r^2\\)");
    assert_eq!(second.context, "Uni > test > Formula");
}

#[test]
fn anchor_points_at_end_of_card_line() {
    let text = "intro\nA ==b== c\nafter\n";
    let extraction = extract_text(text).unwrap();
    let anchor = &extraction.units[0].anchor;
    assert_eq!(&text[..anchor.insert_at], "intro\nA ==b== c");
    assert!(!anchor.crlf);
}

#[test]
fn embedded_marker_is_parsed_with_digit_span() {
    let text = "A ==b==\n<!--NoteID:1700000000001-->\nnext\n";
    let extraction = extract_text(text).unwrap();
    let unit = &extraction.units[0];
    let marker = unit.anchor.marker.as_ref().unwrap();
    assert_eq!(marker.id, NoteId(1_700_000_000_001));
    assert_eq!(&text[marker.digits.clone()], "1700000000001");
    assert_eq!(unit.embedded_id(), Some(NoteId(1_700_000_000_001)));
}

#[test]
fn clozes_are_numbered_per_line() {
    let extraction = extract_text("==a== and ==b==\n==c==\n").unwrap();
    assert_eq!(extraction.units[0].content, "{{c1::a}} and {{c2::b}}");
    assert_eq!(extraction.units[1].content, "{{c1::c}}");
}

#[test]
fn unterminated_highlight_is_a_parse_error() {
    let err = extract_text("ok\n==open without close\n").unwrap_err();
    match err {
        ExtractError::Parse { path, line, .. } => {
            assert_eq!(path, "Uni/test.md");
            assert_eq!(line, 2);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn unterminated_math_on_card_line_is_a_parse_error() {
    assert!(matches!(
        extract_text("==x== costs $5\n"),
        Err(ExtractError::Parse { line: 1, .. })
    ));
}

#[test]
fn code_is_copied_verbatim_and_fences_are_skipped() {
    let text = "```\n==not a card==\n```\n`a == b` is ==equality==\n`x == y`\n";
    let extraction = extract_text(text).unwrap();
    assert_eq!(extraction.units.len(), 1);
    assert_eq!(extraction.units[0].content, "`a == b` is {{c1::equality}}");
}

#[test]
fn wiki_links_render_alias_or_target() {
    let extraction = extract_text("==[[Ableitung|derivative]]== of [[Limit]]\n").unwrap();
    assert_eq!(extraction.units[0].content, "{{c1::derivative}} of Limit");
}

#[test]
fn embedded_image_is_attached_as_picture() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    std::fs::create_dir_all(root.join("Uni")).unwrap();
    std::fs::write(root.join("Uni/graph.png"), b"png").unwrap();
    let source = SourceFile {
        key: "Uni/test.md".to_string(),
        absolute: root.join("Uni/test.md"),
    };

    let extraction = MarkdownExtractor::new(root)
        .extract(&source, b"==Graph== ![[graph.png]]\n", &PassthroughRenderer)
        .unwrap();
    let unit = &extraction.units[0];
    assert_eq!(unit.content, "{{c1::Graph}} ");
    assert_eq!(unit.pictures.len(), 1);
    assert_eq!(unit.pictures[0].filename, "graph.png");
    assert_eq!(unit.pictures[0].path, root.join("Uni/graph.png"));
}

#[test]
fn missing_image_falls_back_to_link_text() {
    let extraction = extract_text("==x== ![[nowhere.png]]\n").unwrap();
    assert_eq!(extraction.units[0].content, "{{c1::x}} nowhere.png");
    assert!(extraction.units[0].pictures.is_empty());
}

#[test]
fn render_failure_keeps_raw_source_and_flags_unit() {
    let extractor = MarkdownExtractor::new("/vault");
    let source = SourceFile {
        key: "m.md".to_string(),
        absolute: PathBuf::from("/vault/m.md"),
    };
    let extraction = extractor
        .extract(&source, b"==E== is $x^{2}$\n", &FailingRenderer)
        .unwrap();
    let unit = &extraction.units[0];
    assert_eq!(unit.content, "{{c1::E}} is $x^{2} $");
    assert_eq!(unit.render_issues.len(), 1);
}

#[test]
fn identical_bytes_extract_identically() {
    let first = extract_text(SCENARIO).unwrap();
    let second = extract_text(SCENARIO).unwrap();
    assert_eq!(first, second);
}

#[test]
fn crlf_lines_keep_offsets_and_flag() {
    let text = "# H\r\n==a==\r\n<!--NoteID:5-->\r\n";
    let extraction = extract_text(text).unwrap();
    let unit = &extraction.units[0];
    assert!(unit.anchor.crlf);
    assert_eq!(&text[..unit.anchor.insert_at], "# H\r\n==a==");
    assert_eq!(unit.embedded_id(), Some(NoteId(5)));
}

#[test]
fn nested_headings_build_breadcrumb() {
    let text = "# A\n### C\n==x==\n## B\n==y==\n";
    let extraction = extract_text(text).unwrap();
    assert_eq!(extraction.units[0].context, "Uni > test > A > C");
    assert_eq!(extraction.units[1].context, "Uni > test > A > B");
}
