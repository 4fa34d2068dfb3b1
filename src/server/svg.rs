//! Renders the game-over scoreboard as a standalone SVG document.

use serde::Deserialize;

#[derive(Clone, Debug, Deserialize)]
pub struct ScoreboardRequest {
    #[serde(default)]
    pub room_id: Option<String>,
    pub scores: Vec<ScoreRow>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ScoreRow {
    pub name: String,
    pub score: u32,
}

const ROW_HEIGHT: u32 = 34;
const WIDTH: u32 = 420;
const HEADER_HEIGHT: u32 = 72;

/// Build the final-scores card. Rows come out ranked highest first.
pub fn render_scoreboard(request: &ScoreboardRequest) -> String {
    let mut rows = request.scores.clone();
    rows.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.name.cmp(&b.name)));

    let height = HEADER_HEIGHT + ROW_HEIGHT * rows.len().max(1) as u32 + 24;
    let mut svg = String::new();

    svg.push_str(&format!(
        r#"<svg xmlns="http://www.w3.org/2000/svg" width="{w}" height="{h}" viewBox="0 0 {w} {h}">"#,
        w = WIDTH,
        h = height,
    ));
    svg.push_str(&format!(
        r##"<rect width="{w}" height="{h}" rx="12" fill="#1f2335"/>"##,
        w = WIDTH,
        h = height,
    ));
    svg.push_str(
        r##"<text x="24" y="40" font-family="sans-serif" font-size="24" font-weight="bold" fill="#ffffff">Game over</text>"##,
    );

    if let Some(room_id) = &request.room_id {
        svg.push_str(&format!(
            r##"<text x="24" y="62" font-family="sans-serif" font-size="13" fill="#9aa0b5">room {}</text>"##,
            escape(room_id),
        ));
    }

    for (rank, row) in rows.iter().enumerate() {
        let y = HEADER_HEIGHT + ROW_HEIGHT * rank as u32;
        let color = match rank {
            0 => "#f5c542",
            1 => "#c0c6d4",
            2 => "#cd8d52",
            _ => "#e4e7f1",
        };
        svg.push_str(&format!(
            r##"<text x="24" y="{y}" font-family="sans-serif" font-size="16" fill="{color}">{rank}. {name}</text>"##,
            y = y + 22,
            color = color,
            rank = rank + 1,
            name = escape(&row.name),
        ));
        svg.push_str(&format!(
            r##"<text x="{x}" y="{y}" font-family="sans-serif" font-size="16" text-anchor="end" fill="{color}">{score}</text>"##,
            x = WIDTH - 24,
            y = y + 22,
            color = color,
            score = row.score,
        ));
    }

    svg.push_str("</svg>");
    svg
}

fn escape(raw: &str) -> String {
    raw.chars()
        .map(|ch| match ch {
            '&' => "&amp;".to_owned(),
            '<' => "&lt;".to_owned(),
            '>' => "&gt;".to_owned(),
            '"' => "&quot;".to_owned(),
            '\'' => "&apos;".to_owned(),
            _ => ch.to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scoreboard_ranks_highest_first() {
        let svg = render_scoreboard(&ScoreboardRequest {
            room_id: Some("happy-cat".into()),
            scores: vec![
                ScoreRow { name: "bea".into(), score: 217 },
                ScoreRow { name: "ann".into(), score: 325 },
            ],
        });

        let ann = svg.find("1. ann").expect("winner listed");
        let bea = svg.find("2. bea").expect("runner-up listed");
        assert!(ann < bea);
        assert!(svg.starts_with("<svg"));
        assert!(svg.contains("room happy-cat"));
    }

    #[test]
    fn names_are_escaped() {
        let svg = render_scoreboard(&ScoreboardRequest {
            room_id: None,
            scores: vec![ScoreRow { name: "<script>".into(), score: 1 }],
        });
        assert!(!svg.contains("<script>"));
        assert!(svg.contains("&lt;script&gt;"));
    }
}
