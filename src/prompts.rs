//! Prompts for rubric grading.
//!
//! Every prompt lives here so the rubric wording can change without touching
//! the retry and parsing code in [`crate::grading`]. The closing
//! "Final Summary" block is what [`crate::grading::parse_summary_scores`]
//! mines, so its line format must stay `N. Category: X/5`.

use crate::grading::{Criterion, GradeReport, Student};

/// Rubric prompt; `{architect}` is replaced by [`rubric_prompt`].
pub const RUBRIC_PROMPT: &str = r#"You are grading a student's architecture assignment about the architect {architect}.

The submission is a formal piece of coursework. Every page is attached as an image, so you can see the layout, the embedded images, the captions and the structure directly.

HOW TO GRADE
- Be fair and constructive. Call out inconsistent formatting, missing information and weak citations plainly.
- Note real strengths; criticise real flaws. Students will revise from your feedback.
- Weigh most heavily: accuracy of academic citations, clarity of image captions and attribution, a clear split between interior and exterior images, and overall visual professionalism.

WHAT THE SUBMISSION SHOULD CONTAIN
- Embedded images (not just links), with captions that credit a URL or photographer
- A student photo and short bio on page 2
- A table of contents
- Ten described buildings
- Repeated links are usually citations, not missing content

For each category below write one or two paragraphs of justification, then a score out of 5:

**[Category Name]**
Justification: ...
Score: x/5

CATEGORIES AND ANCHORS

**1. Architect Selection & Scope**
- 5: one architect from Book Two, named explicitly, on topic
- 3-4: Book Two architect, but clarity or justification could improve
- 1-2: architect unclear, off topic or not from Book Two

**2. Organization & Document Setup**
- 5: table of contents and labelled sections for bio, buildings, references, student bio
- 3-4: minor layout issues or missing headers
- 1-2: poorly organised, sections missing, hard to follow

**3. Biographical Content (750 words)**
- 5: who they are, achievements, education, significance, first building, typologies
- 3-4: mostly complete, light on detail
- 1-2: underdeveloped or short, major points missing

**4. Citation of Architect Biography**
- 5: 5-10 academic references in correct APA with DOIs and citation counts
- 3-4: APA errors or missing DOIs, sources still academic
- 1-2: few or no academic references

**5. Selection & Quality of Images**
- 5: ten buildings, 3+ exterior and 5+ interior images each, high resolution
- 3-4: most buildings meet this; a few lack resolution or quantity
- 1-2: many buildings lack images or images are poor

**6. Image Citation & Attribution**
- 5: every image carries a clear, consistent source or photographer credit
- 3-4: most are credited, with inconsistencies
- 1-2: credits mostly missing or malformed

**7. Coverage of 10 Famous Buildings**
- 5: all ten named with location and a one or two sentence significance statement
- 3-4: listed, but some lack significance or location
- 1-2: several missing or incomplete

**8. Image Relevance**
- 5: every image shows the described building and its architectural value
- 3-4: mostly relevant, some generic or misaligned
- 1-2: several images off topic

**9. Personal Bio & Photo**
- 5: professional photo and one or two sentence bio, placed after the table of contents
- 3-4: present, minor formatting or image issues
- 1-2: low quality, misplaced or absent

**10. Overall Completeness & Presentation**
- 5: polished, clean layout, little repetition, fit for publication
- 3-4: clear, but lacks design polish or repeats itself
- 1-2: rushed; visual issues hurt readability

End your answer with a block in exactly this form:

**Final Summary:**
{summary_lines}
"#;

/// The rubric prompt for `architect`.
pub fn rubric_prompt(architect: &str) -> String {
    let summary_lines = Criterion::ALL
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{}. {}: X/5", i + 1, c.label()))
        .collect::<Vec<_>>()
        .join("\n");
    RUBRIC_PROMPT
        .replace("{architect}", architect)
        .replace("{summary_lines}", &summary_lines)
}

/// User turn accompanying the page images.
pub const GRADE_REQUEST: &str = "Here is the submission. Please start your rubric-based analysis.";

/// Student-facing feedback request.
pub const FEEDBACK_PROMPT: &str = r#"You are writing feedback for {name} (PID: {pid}) on their architecture submission about {architect}.
Summarize their performance across categories, highlight strengths, and offer suggestions for improvement.
Their final score is {final_percent}% and grade is {grade}.

Rubric scores:
{score_lines}
"#;

/// The feedback request for `student`, filled from `report`.
pub fn feedback_prompt(student: &Student, report: &GradeReport) -> String {
    let card = &report.scorecard;
    let score_lines = Criterion::ALL
        .iter()
        .enumerate()
        .map(|(i, c)| match card.scores.get(c) {
            Some(score) => format!("{}. {}: {}/5", i + 1, c.label(), score),
            None => format!("{}. {}: not scored", i + 1, c.label()),
        })
        .collect::<Vec<_>>()
        .join("\n");
    FEEDBACK_PROMPT
        .replace("{name}", &student.name)
        .replace("{pid}", &student.pid)
        .replace("{architect}", &report.architect)
        .replace("{final_percent}", &card.final_percent.to_string())
        .replace("{grade}", card.grade.as_str())
        .replace("{score_lines}", &score_lines)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_names_architect_and_every_criterion() {
        let p = rubric_prompt("Zaha Hadid");
        assert!(p.contains("about the architect Zaha Hadid."));
        assert!(!p.contains("{summary_lines}"));
        for c in Criterion::ALL {
            assert!(p.contains(c.label()), "missing {}", c.label());
        }
        assert!(p.contains("10. Overall Completeness & Presentation: X/5"));
    }

    #[test]
    fn feedback_prompt_carries_percent_and_grade() {
        let report = GradeReport::from_evaluation(
            "Tadao Ando",
            "**Final Summary:**\n1. Architect Selection & Scope: 5/5\n8. Image Relevance: 4/5\n"
                .to_string(),
        );
        let p = feedback_prompt(&Student::new("Ada", "A99"), &report);
        assert!(p.contains("feedback for Ada (PID: A99)"));
        assert!(p.contains("about Tadao Ando."));
        assert!(p.contains("final score is 18% and grade is F."));
        assert!(p.contains("8. Image Relevance: 4/5"));
        assert!(p.contains("2. Organization & Document Setup: not scored"));
        assert!(!p.contains('{'));
    }
}
