use scraper::ElementRef;
use scraper::node::Node;

/// Text content of an element with `<br>` turned into newlines and the
/// contents of `<script>` and `<style>` left out.
pub fn normalized_text(element: ElementRef<'_>) -> String {
    let mut out = String::new();
    collect(element, &mut out);
    out
}

fn collect(element: ElementRef<'_>, out: &mut String) {
    for child in element.children() {
        match child.value() {
            Node::Text(text) => out.push_str(text),
            Node::Element(el) => match el.name() {
                "br" => out.push('\n'),
                "script" | "style" => {}
                _ => {
                    if let Some(child) = ElementRef::wrap(child) {
                        collect(child, out);
                    }
                }
            },
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use scraper::{Html, Selector};

    use super::*;

    fn text_of(html: &str, selector: &str) -> String {
        let doc = Html::parse_document(html);
        let selector = Selector::parse(selector).unwrap();
        normalized_text(doc.select(&selector).next().unwrap())
    }

    #[test]
    fn breaks_become_newlines() {
        assert_eq!(
            text_of("<div>Ankara<br>Çankaya<br/>Kızılay</div>", "div"),
            "Ankara\nÇankaya\nKızılay"
        );
    }

    #[test]
    fn scripts_and_styles_are_skipped() {
        assert_eq!(
            text_of(
                "<div>a<script>var x = 1;</script><style>p{}</style><b>b</b></div>",
                "div"
            ),
            "ab"
        );
    }

    #[test]
    fn whitespace_is_preserved() {
        assert_eq!(text_of("<div>  hello  </div>", "div"), "  hello  ");
    }
}
