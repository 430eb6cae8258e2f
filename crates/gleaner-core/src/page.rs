//! Turns a matched page into a [`ScrapedPage`] ready for submission.

use crate::interpreter::Interpreter;
use crate::job::{JobSource, ScrapedPage};
use crate::matcher::{MatchedResource, PageDocument};
use crate::resource::Payload;

/// Run the matched resource's interpreter over the document.
///
/// Extraction failures never escape: they are logged, the payload degrades
/// to `{}` and the error text is appended to the warnings.
pub fn process_page(
    document: &PageDocument,
    matched: MatchedResource,
    source: JobSource,
) -> ScrapedPage {
    let MatchedResource {
        resource,
        variables,
    } = matched;

    let mut interpreter = Interpreter::new(&resource);
    let result = interpreter.parse(&document.html);
    let mut warnings = interpreter.take_warnings();

    let payload = match result {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!(
                resource_id = %resource.id,
                url = %document.url,
                error = %e,
                "Extraction failed"
            );
            warnings.push(e.to_string());
            Payload::new()
        }
    };

    ScrapedPage {
        resource_id: resource.id,
        payload,
        variables,
        source,
        warnings,
    }
}
