//! Login command: interactive OAuth2 sign-in

use anyhow::Result;
use clap::Args;
use tracing::info;

use crate::wiring::CliContext;

#[derive(Debug, Args)]
pub struct LoginCommand {
    /// Print the authorization URL and read the redirect URL from stdin
    /// instead of opening a browser with a loopback listener
    #[arg(long)]
    pub paste_redirect: bool,
}

impl LoginCommand {
    pub async fn execute(&self, ctx: &CliContext) -> Result<()> {
        let auth = ctx.auth_manager()?;

        if self.paste_redirect {
            let (url, _csrf, verifier) = auth.flow().generate_auth_url();
            println!("Visit this URL in a browser and sign in:\n\n{url}\n");
            println!("Paste the full redirect URL you were sent to:");

            let mut redirect = String::new();
            std::io::stdin().read_line(&mut redirect)?;
            auth.login_with_redirect(redirect.trim(), verifier).await?;
        } else {
            auth.login().await?;
        }

        info!("Signed in; refresh token stored");
        println!("Login successful.");
        Ok(())
    }
}
